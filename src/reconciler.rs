//! Offline ledger repair and statement balance checks.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rusqlite::Connection;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::catalog;
use crate::categorizer;
use crate::db::decimal_to_sql;
use crate::error::{CuadraError, Result};
use crate::ledger::{self, NewLeg};
use crate::models::{AccountNature, Transaction, TransactionKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Balanced,
    /// A transfer with a single leg.
    Orphan,
    /// Two or more legs that do not sum to zero.
    Unbalanced,
}

#[derive(Debug, Clone)]
pub struct GroupIssue {
    pub group_id: String,
    pub status: GroupStatus,
    pub legs: Vec<Transaction>,
    pub sum: Decimal,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub balanced: usize,
    /// Single-leg expense and income entries.
    pub simple: usize,
    pub issues: Vec<GroupIssue>,
}

impl ScanReport {
    pub fn orphans(&self) -> usize {
        self.issues.iter().filter(|i| i.status == GroupStatus::Orphan).count()
    }

    pub fn unbalanced(&self) -> usize {
        self.issues.iter().filter(|i| i.status == GroupStatus::Unbalanced).count()
    }
}

pub fn classify_group(legs: &[Transaction]) -> Option<GroupStatus> {
    let double_entry = legs.iter().any(|l| l.kind == TransactionKind::Transfer);
    let sum: Decimal = legs.iter().map(|l| l.amount).sum();
    match legs.len() {
        0 => None,
        1 if double_entry => Some(GroupStatus::Orphan),
        1 => None,
        _ if sum.is_zero() => Some(GroupStatus::Balanced),
        _ => Some(GroupStatus::Unbalanced),
    }
}

/// Group every transaction by `group_id` and report the ones that break the
/// double-entry balance.
pub fn scan(conn: &Connection) -> Result<ScanReport> {
    let mut groups: BTreeMap<String, Vec<Transaction>> = BTreeMap::new();
    for txn in ledger::all_transactions(conn)? {
        groups.entry(txn.group_id.clone()).or_default().push(txn);
    }

    let mut report = ScanReport::default();
    for (group_id, legs) in groups {
        match classify_group(&legs) {
            None => report.simple += 1,
            Some(GroupStatus::Balanced) => report.balanced += 1,
            Some(status) => {
                let sum = legs.iter().map(|l| l.amount).sum();
                report.issues.push(GroupIssue { group_id, status, legs, sum });
            }
        }
    }
    info!(
        balanced = report.balanced,
        orphans = report.orphans(),
        unbalanced = report.unbalanced(),
        "Ledger scan"
    );
    Ok(report)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Repair {
    pub group_id: String,
    pub status: GroupStatus,
    pub principal_id: i64,
    /// Legs removed before regenerating the counter-leg.
    pub removed: Vec<i64>,
    pub counter_account: String,
    pub counter_amount: Decimal,
}

#[derive(Debug, Default)]
pub struct FixReport {
    pub repairs: Vec<Repair>,
    pub failures: Vec<(String, String)>,
    pub dry_run: bool,
}

/// The statement-side leg of a group: the one carrying the original bank
/// description, else the oldest.
fn principal_leg(legs: &[Transaction]) -> Option<&Transaction> {
    legs.iter()
        .find(|l| l.bank_description.is_some())
        .or_else(|| legs.iter().min_by_key(|l| l.id))
}

fn counter_account_name(conn: &Connection, principal: &Transaction) -> Result<String> {
    if let Some(id) = principal.service_account_id {
        if id != principal.account_id {
            return Ok(catalog::get_account(conn, id)?.name);
        }
    }
    let text = principal.bank_description.as_deref().unwrap_or(&principal.description);
    categorizer::counterparty_account(text).ok_or_else(|| {
        CuadraError::LedgerIntegrity(format!(
            "no counterparty account can be derived for \"{}\"",
            principal.description
        ))
    })
}

fn plan(conn: &Connection, issue: &GroupIssue) -> Result<Repair> {
    let principal = principal_leg(&issue.legs).ok_or_else(|| CuadraError::BalanceInvariant {
        group_id: issue.group_id.clone(),
        sum: issue.sum.to_string(),
    })?;
    let principal_id = principal.id.ok_or_else(|| CuadraError::Other("leg without id".into()))?;
    let removed = issue
        .legs
        .iter()
        .filter_map(|l| l.id)
        .filter(|id| *id != principal_id)
        .collect();
    Ok(Repair {
        group_id: issue.group_id.clone(),
        status: issue.status,
        principal_id,
        removed,
        counter_account: counter_account_name(conn, principal)?,
        counter_amount: -principal.amount,
    })
}

fn apply(conn: &Connection, issue: &GroupIssue, repair: &Repair) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    let principal = issue
        .legs
        .iter()
        .find(|l| l.id == Some(repair.principal_id))
        .ok_or_else(|| CuadraError::Other(format!("leg {} vanished", repair.principal_id)))?;

    for id in &repair.removed {
        tx.execute(
            "DELETE FROM transfers WHERE origin_txn_id = ?1 OR destination_txn_id = ?1",
            [id],
        )?;
        tx.execute("DELETE FROM transactions WHERE id = ?1", [id])?;
    }
    tx.execute(
        "DELETE FROM transfers WHERE origin_txn_id = ?1 OR destination_txn_id = ?1",
        [repair.principal_id],
    )?;

    let counter = catalog::resolve_or_create_account(&tx, &repair.counter_account, &principal.currency)?;
    if counter.id == principal.account_id {
        return Err(CuadraError::LedgerIntegrity(format!(
            "counter-leg would land on the principal's own account ({})",
            counter.name
        )));
    }
    let counter_id = ledger::insert_leg(
        &tx,
        &NewLeg {
            group_id: &repair.group_id,
            account_id: counter.id,
            service_account_id: Some(principal.account_id),
            kind: TransactionKind::Transfer,
            amount: repair.counter_amount,
            date: principal.date,
            description: &principal.description,
            category_id: principal.category_id,
            currency: &principal.currency,
            bank_description: None,
            balance_after: None,
            bank_reference: None,
            batch_id: principal.batch_id,
        },
    )?;
    tx.execute(
        "UPDATE transactions SET kind = 'TRANSFER', service_account_id = ?1 WHERE id = ?2",
        [counter.id, repair.principal_id],
    )?;
    ledger::link_transfer(
        &tx,
        (repair.principal_id, principal.amount),
        (counter_id, repair.counter_amount),
    )?;

    let sum: Decimal = ledger::group_legs(&tx, &repair.group_id)?.iter().map(|l| l.amount).sum();
    if !sum.is_zero() {
        return Err(CuadraError::BalanceInvariant {
            group_id: repair.group_id.clone(),
            sum: sum.to_string(),
        });
    }
    tx.commit()?;
    Ok(())
}

/// Plan (and unless `dry_run`, apply) a repair for every problem group.
/// Each group is repaired in its own transaction; one failure does not stop
/// the others.
pub fn fix(conn: &Connection, dry_run: bool) -> Result<FixReport> {
    let scan = scan(conn)?;
    let mut report = FixReport { dry_run, ..Default::default() };
    for issue in &scan.issues {
        let outcome = plan(conn, issue).and_then(|repair| {
            if !dry_run {
                apply(conn, issue, &repair)?;
            }
            Ok(repair)
        });
        match outcome {
            Ok(repair) => report.repairs.push(repair),
            Err(e @ (CuadraError::Db(_) | CuadraError::Io(_))) => return Err(e),
            Err(e) => {
                warn!(group = %issue.group_id, error = %e, "Group could not be repaired");
                report.failures.push((issue.group_id.clone(), e.to_string()));
            }
        }
    }
    info!(
        repaired = report.repairs.len(),
        failed = report.failures.len(),
        dry_run,
        "Ledger repair"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Statement balance check
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceCheck {
    pub is_reconciled: bool,
    pub statement_balance: Decimal,
    pub calculated_balance: Decimal,
    pub discrepancy: Decimal,
    /// Legs flagged reconciled by this check.
    pub marked: usize,
}

/// Compare the ledger balance of `account_name` on `as_of` with the
/// statement's closing balance. Creditor accounts report the amount owed.
/// A match marks every leg up to `as_of` reconciled.
pub fn check_balance(
    conn: &Connection,
    account_name: &str,
    as_of: NaiveDate,
    statement_balance: Decimal,
) -> Result<BalanceCheck> {
    let account = catalog::require_account(conn, account_name)?;
    let sum = ledger::account_balance(conn, account.id, Some(as_of))?;
    let calculated = match account.nature {
        AccountNature::Debtor => sum,
        AccountNature::Creditor => -sum,
    };
    let discrepancy = (calculated - statement_balance).abs();
    let is_reconciled = discrepancy < Decimal::new(1, 2);

    conn.execute(
        "INSERT INTO reconciliations (account_id, as_of, statement_balance, calculated_balance, is_reconciled, reconciled_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, CASE WHEN ?5 = 1 THEN datetime('now') ELSE NULL END)",
        rusqlite::params![
            account.id,
            as_of,
            decimal_to_sql(statement_balance),
            decimal_to_sql(calculated),
            is_reconciled as i32,
        ],
    )?;

    let marked = if is_reconciled {
        conn.execute(
            "UPDATE transactions SET is_reconciled = 1 WHERE account_id = ?1 AND date <= ?2 AND is_reconciled = 0",
            rusqlite::params![account.id, as_of],
        )?
    } else {
        0
    };

    Ok(BalanceCheck {
        is_reconciled,
        statement_balance,
        calculated_balance: calculated,
        discrepancy: discrepancy.round_dp(2),
        marked,
    })
}
