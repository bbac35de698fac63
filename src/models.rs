use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::CuadraError;
use crate::memory::{PatternDefinition, PatternType};

/// Which sign of movement grows an account's balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountNature {
    /// Asset-like: grows when funds are received (checking, cash).
    Debtor,
    /// Liability-like: grows when the obligation grows (credit card).
    Creditor,
}

/// Whether a leg raises or lowers its account's natural balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Increase,
    Decrease,
}

impl AccountNature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debtor => "DEUDORA",
            Self::Creditor => "ACREEDORA",
        }
    }

    /// Statement columns are labelled from the bank's side of the relationship:
    /// a "cargo" is money the bank takes from the customer. On a debtor account
    /// that is a decrease; on a creditor account the debt grows, so it is an
    /// increase.
    pub fn direction_for_statement(&self, is_bank_debit: bool) -> Direction {
        match (self, is_bank_debit) {
            (Self::Debtor, true) => Direction::Decrease,
            (Self::Debtor, false) => Direction::Increase,
            (Self::Creditor, true) => Direction::Increase,
            (Self::Creditor, false) => Direction::Decrease,
        }
    }

    /// Stored amounts carry the cash-flow sign of the leg's account.
    pub fn signed_amount(&self, direction: Direction, magnitude: Decimal) -> Decimal {
        let magnitude = magnitude.abs();
        match (self, direction) {
            (Self::Debtor, Direction::Increase) | (Self::Creditor, Direction::Decrease) => magnitude,
            (Self::Debtor, Direction::Decrease) | (Self::Creditor, Direction::Increase) => -magnitude,
        }
    }
}

impl FromStr for AccountNature {
    type Err = CuadraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DEUDORA" | "DEBTOR" | "DEBIT" => Ok(Self::Debtor),
            "ACREEDORA" | "CREDITOR" | "CREDIT" => Ok(Self::Creditor),
            other => Err(CuadraError::Other(format!(
                "Invalid account nature: {other} (must be 'deudora' or 'acreedora')"
            ))),
        }
    }
}

impl fmt::Display for AccountNature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionKind {
    Expense,
    Income,
    Transfer,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expense => "EXPENSE",
            Self::Income => "INCOME",
            Self::Transfer => "TRANSFER",
        }
    }

    /// EXPENSE rows are negative, INCOME rows positive, and nothing is zero.
    pub fn accepts_amount(&self, amount: Decimal) -> bool {
        if amount.is_zero() {
            return false;
        }
        match self {
            Self::Expense => amount.is_sign_negative(),
            Self::Income => amount.is_sign_positive(),
            Self::Transfer => true,
        }
    }

    /// Fallback used when nothing better is known: outflows are expenses.
    pub fn from_cash_flow(amount: Decimal) -> Self {
        if amount.is_sign_negative() {
            Self::Expense
        } else {
            Self::Income
        }
    }
}

impl FromStr for TransactionKind {
    type Err = CuadraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "EXPENSE" | "GASTO" => Ok(Self::Expense),
            "INCOME" | "INGRESO" => Ok(Self::Income),
            "TRANSFER" | "TRANSFERENCIA" => Ok(Self::Transfer),
            other => Err(CuadraError::Other(format!("Invalid transaction kind: {other}"))),
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub account_type: String,
    pub nature: AccountNature,
    pub currency: String,
    pub reference: Option<String>,
    pub is_payment_medium: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub scope: String,
    pub kind: String,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: Option<i64>,
    pub group_id: String,
    pub account_id: i64,
    pub service_account_id: Option<i64>,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub description: String,
    pub category_id: Option<i64>,
    pub currency: String,
    pub is_reconciled: bool,
    pub bank_description: Option<String>,
    pub balance_after: Option<Decimal>,
    pub bank_reference: Option<String>,
    pub batch_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub id: i64,
    pub origin_txn_id: i64,
    pub destination_txn_id: i64,
}

/// One normalized statement line. `amount` is always a magnitude; the
/// direction lives in `is_debit` (bank perspective).
#[derive(Debug, Clone, PartialEq)]
pub struct RawMovement {
    pub date: NaiveDate,
    pub description: String,
    pub is_debit: bool,
    pub amount: Decimal,
    pub running_balance: Option<Decimal>,
    pub reference: Option<String>,
}

impl RawMovement {
    /// Cash-flow sign as seen by the statement holder: charges are outflows.
    pub fn signed_amount(&self) -> Decimal {
        if self.is_debit {
            -self.amount
        } else {
            self.amount
        }
    }

    /// Short locator used in error reports.
    pub fn locator(&self) -> String {
        let prefix: String = self.description.chars().take(40).collect();
        format!("{} {} \"{}\"", self.date, self.signed_amount(), prefix)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassificationSource {
    Memory { pattern_type: PatternType, pattern_id: String },
    Rule,
    Ai,
    Fallback,
    Human,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory { .. } => "memory",
            Self::Rule => "rule",
            Self::Ai => "ai",
            Self::Fallback => "fallback",
            Self::Human => "human",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub kind: TransactionKind,
    pub category: String,
    pub linked_account: Option<String>,
    pub confidence: f64,
    pub source: ClassificationSource,
    pub note: Option<String>,
}

impl Classification {
    pub fn fallback(amount: Decimal) -> Self {
        Self {
            kind: TransactionKind::from_cash_flow(amount),
            category: crate::categorizer::UNCATEGORIZED.to_string(),
            linked_account: None,
            confidence: 0.1,
            source: ClassificationSource::Fallback,
            note: None,
        }
    }

    pub fn memory_pattern(&self) -> Option<(PatternType, &str)> {
        match &self.source {
            ClassificationSource::Memory { pattern_type, pattern_id } => {
                Some((*pattern_type, pattern_id.as_str()))
            }
            _ => None,
        }
    }
}

/// Review lifecycle of a staged movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewState {
    Pending,
    Confirmed,
    Corrected,
    Ignored,
}

impl ReviewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Corrected => "corrected",
            Self::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "confirmed" => Self::Confirmed,
            "corrected" => Self::Corrected,
            "ignored" => Self::Ignored,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone)]
pub struct StagedMovement {
    pub id: i64,
    pub batch_id: i64,
    pub row_index: i64,
    pub movement: RawMovement,
    pub classification: Classification,
    /// Pattern the classifier proposed learning once the movement is confirmed.
    pub suggestion: Option<PatternDefinition>,
    pub duplicate_of: Option<i64>,
    pub state: ReviewState,
    pub error: Option<String>,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImportBatch {
    pub id: i64,
    pub filename: String,
    pub account_id: i64,
    pub checksum: Option<String>,
    pub movement_count: i64,
    pub total_debit: Decimal,
    pub total_credit: Decimal,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub processed: i64,
    pub skipped: i64,
    pub errored: i64,
    pub status: String,
}
