//! Double-entry writer. Every economic event becomes a group of legs sharing a
//! `group_id`; transfers carry two legs that sum to zero plus a `transfers`
//! row linking them.

use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::catalog;
use crate::categorizer;
use crate::db::{decimal_column, decimal_to_sql, optional_decimal_column};
use crate::error::{CuadraError, Result};
use crate::models::{Account, Classification, RawMovement, Transaction, TransactionKind};

/// A classified statement movement ready to be recorded against `account`.
pub struct Posting<'a> {
    pub account: &'a Account,
    pub movement: &'a RawMovement,
    pub classification: &'a Classification,
    pub batch_id: Option<i64>,
    /// Existing transaction whose whole group this posting replaces.
    pub replaces: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostedGroup {
    pub group_id: String,
    pub principal_id: i64,
    pub counter_id: Option<i64>,
    pub transfer_id: Option<i64>,
}

/// Leg to insert. Shared with the repair tooling.
#[derive(Debug, Clone)]
pub(crate) struct NewLeg<'a> {
    pub group_id: &'a str,
    pub account_id: i64,
    pub service_account_id: Option<i64>,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub date: chrono::NaiveDate,
    pub description: &'a str,
    pub category_id: Option<i64>,
    pub currency: &'a str,
    pub bank_description: Option<&'a str>,
    pub balance_after: Option<Decimal>,
    pub bank_reference: Option<&'a str>,
    pub batch_id: Option<i64>,
}

pub(crate) fn insert_leg(conn: &Connection, leg: &NewLeg<'_>) -> Result<i64> {
    if !leg.kind.accepts_amount(leg.amount) {
        return Err(CuadraError::LedgerIntegrity(format!(
            "{} leg cannot carry amount {}",
            leg.kind, leg.amount
        )));
    }
    conn.execute(
        "INSERT INTO transactions (group_id, account_id, service_account_id, kind, amount, date, \
         description, category_id, currency, bank_description, balance_after, bank_reference, batch_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        rusqlite::params![
            leg.group_id,
            leg.account_id,
            leg.service_account_id,
            leg.kind.as_str(),
            decimal_to_sql(leg.amount),
            leg.date,
            leg.description,
            leg.category_id,
            leg.currency,
            leg.bank_description,
            leg.balance_after.map(decimal_to_sql),
            leg.bank_reference,
            leg.batch_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Link two legs of a transfer; the outflow leg is the origin.
pub(crate) fn link_transfer(conn: &Connection, a: (i64, Decimal), b: (i64, Decimal)) -> Result<i64> {
    let (origin, destination) = if a.1.is_sign_negative() { (a.0, b.0) } else { (b.0, a.0) };
    conn.execute(
        "INSERT INTO transfers (origin_txn_id, destination_txn_id) VALUES (?1, ?2)",
        [origin, destination],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn new_group_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Stored amount for the statement holder's leg. The statement labels are
/// from the bank's side, so the direction is derived from the account nature.
pub fn principal_amount(account: &Account, movement: &RawMovement) -> Decimal {
    let direction = account.nature.direction_for_statement(movement.is_debit);
    account.nature.signed_amount(direction, movement.amount)
}

/// Record one movement. Everything happens in a single SQLite transaction:
/// either all legs (and the replaced group's removal) commit, or none do.
/// `record` runs inside that transaction so the caller's own bookkeeping
/// commits or rolls back together with the legs.
pub fn post<F>(conn: &Connection, posting: &Posting<'_>, record: F) -> Result<PostedGroup>
where
    F: FnOnce(&Connection, &PostedGroup) -> Result<()>,
{
    let tx = conn.unchecked_transaction()?;
    let posted = post_in(&tx, posting)?;
    record(&tx, &posted)?;
    tx.commit()?;
    info!(
        group = %posted.group_id,
        legs = if posted.counter_id.is_some() { 2 } else { 1 },
        "Posted movement"
    );
    Ok(posted)
}

fn post_in(conn: &Connection, posting: &Posting<'_>) -> Result<PostedGroup> {
    let Posting { account, movement, classification, batch_id, replaces } = posting;
    let kind = classification.kind;
    let amount = principal_amount(account, movement);

    if amount.is_zero() {
        return Err(CuadraError::LedgerIntegrity("zero amount cannot be recorded".into()));
    }
    if !kind.accepts_amount(amount) {
        return Err(CuadraError::LedgerIntegrity(format!(
            "{kind} cannot be recorded with amount {amount} on {}",
            account.name
        )));
    }
    if !account.is_active {
        return Err(CuadraError::LedgerIntegrity(format!("account '{}' is inactive", account.name)));
    }

    if let Some(existing) = replaces {
        let removed = delete_group_of(conn, *existing)?;
        debug!(existing, removed, "Replaced existing group");
    }

    let category = catalog::resolve_or_create_category(conn, &classification.category, kind)?;
    let group_id = new_group_id();

    let counterparty = match kind {
        TransactionKind::Transfer => {
            let name = classification
                .linked_account
                .clone()
                .or_else(|| categorizer::counterparty_account(&movement.description))
                .ok_or_else(|| {
                    CuadraError::LedgerIntegrity("transfer has no counterparty account".into())
                })?;
            let counter = catalog::resolve_or_create_account(conn, &name, &account.currency)?;
            if counter.id == account.id {
                return Err(CuadraError::LedgerIntegrity(format!(
                    "transfer legs must use different accounts ({})",
                    account.name
                )));
            }
            Some(counter)
        }
        _ => match classification.linked_account.as_deref() {
            Some(name) if !name.trim().is_empty() => {
                let service = catalog::resolve_or_create_account(conn, name, &account.currency)?;
                (service.id != account.id).then_some(service)
            }
            _ => None,
        },
    };

    let principal_id = insert_leg(
        conn,
        &NewLeg {
            group_id: &group_id,
            account_id: account.id,
            service_account_id: counterparty.as_ref().map(|c| c.id),
            kind,
            amount,
            date: movement.date,
            description: &movement.description,
            category_id: Some(category.id),
            currency: &account.currency,
            bank_description: Some(&movement.description),
            balance_after: movement.running_balance,
            bank_reference: movement.reference.as_deref(),
            batch_id: *batch_id,
        },
    )?;

    let (counter_id, transfer_id) = match (kind, counterparty) {
        (TransactionKind::Transfer, Some(counter)) => {
            let counter_id = insert_leg(
                conn,
                &NewLeg {
                    group_id: &group_id,
                    account_id: counter.id,
                    service_account_id: Some(account.id),
                    kind,
                    amount: -amount,
                    date: movement.date,
                    description: &movement.description,
                    category_id: Some(category.id),
                    currency: &account.currency,
                    bank_description: None,
                    balance_after: None,
                    bank_reference: None,
                    batch_id: *batch_id,
                },
            )?;
            let transfer_id = link_transfer(conn, (principal_id, amount), (counter_id, -amount))?;
            (Some(counter_id), Some(transfer_id))
        }
        _ => (None, None),
    };

    Ok(PostedGroup { group_id, principal_id, counter_id, transfer_id })
}

pub fn group_id_of(conn: &Connection, txn_id: i64) -> Result<Option<String>> {
    let group = conn
        .query_row("SELECT group_id FROM transactions WHERE id = ?1", [txn_id], |r| r.get(0))
        .optional()?;
    Ok(group)
}

/// Remove every leg of a group and the transfer linking them. Returns the
/// number of legs deleted.
pub fn delete_group(conn: &Connection, group_id: &str) -> Result<usize> {
    conn.execute(
        "DELETE FROM transfers WHERE origin_txn_id IN (SELECT id FROM transactions WHERE group_id = ?1) \
         OR destination_txn_id IN (SELECT id FROM transactions WHERE group_id = ?1)",
        [group_id],
    )?;
    let n = conn.execute("DELETE FROM transactions WHERE group_id = ?1", [group_id])?;
    Ok(n)
}

fn delete_group_of(conn: &Connection, txn_id: i64) -> Result<usize> {
    match group_id_of(conn, txn_id)? {
        Some(group) => delete_group(conn, &group),
        None => Err(CuadraError::DuplicateConflict {
            existing_id: txn_id,
            detail: "transaction to overwrite no longer exists".into(),
        }),
    }
}

const KIND_COLUMN: usize = 4;

fn transaction_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transaction> {
    let raw_kind: String = row.get(KIND_COLUMN)?;
    let kind = raw_kind.parse::<TransactionKind>().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            KIND_COLUMN,
            rusqlite::types::Type::Text,
            format!("unknown transaction kind '{raw_kind}'").into(),
        )
    })?;
    Ok(Transaction {
        id: row.get(0)?,
        group_id: row.get(1)?,
        account_id: row.get(2)?,
        service_account_id: row.get(3)?,
        kind,
        amount: decimal_column(row, 5)?,
        date: row.get(6)?,
        description: row.get(7)?,
        category_id: row.get(8)?,
        currency: row.get(9)?,
        is_reconciled: row.get::<_, i64>(10)? != 0,
        bank_description: row.get(11)?,
        balance_after: optional_decimal_column(row, 12)?,
        bank_reference: row.get(13)?,
        batch_id: row.get(14)?,
    })
}

/// A leg whose kind cannot be read is a damaged ledger, not a driver error.
fn read_error(e: rusqlite::Error) -> CuadraError {
    match e {
        rusqlite::Error::FromSqlConversionFailure(KIND_COLUMN, _, inner) => {
            CuadraError::LedgerIntegrity(inner.to_string())
        }
        other => other.into(),
    }
}

const TXN_COLUMNS: &str = "id, group_id, account_id, service_account_id, kind, amount, date, description, \
     category_id, currency, is_reconciled, bank_description, balance_after, bank_reference, batch_id";

pub fn group_legs(conn: &Connection, group_id: &str) -> Result<Vec<Transaction>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {TXN_COLUMNS} FROM transactions WHERE group_id = ?1 ORDER BY id"))?;
    let rows = stmt
        .query_map([group_id], transaction_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(read_error)?;
    Ok(rows)
}

pub fn all_transactions(conn: &Connection) -> Result<Vec<Transaction>> {
    let mut stmt = conn.prepare(&format!("SELECT {TXN_COLUMNS} FROM transactions ORDER BY group_id, id"))?;
    let rows = stmt
        .query_map([], transaction_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(read_error)?;
    Ok(rows)
}

/// Sum of an account's legs up to and including `as_of`.
pub fn account_balance(conn: &Connection, account_id: i64, as_of: Option<chrono::NaiveDate>) -> Result<Decimal> {
    let mut stmt = conn.prepare(
        "SELECT amount FROM transactions WHERE account_id = ?1 AND (?2 IS NULL OR date <= ?2)",
    )?;
    let amounts = stmt
        .query_map(rusqlite::params![account_id, as_of], |row| decimal_column(row, 0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(amounts.into_iter().sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{add_account, get_account, NewAccount};
    use crate::db::test_db;
    use crate::models::{AccountNature, ClassificationSource};
    use chrono::NaiveDate;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn account(conn: &Connection, name: &str, nature: AccountNature) -> Account {
        let id = add_account(
            conn,
            &NewAccount {
                name,
                account_type: if nature == AccountNature::Creditor { "credit_card" } else { "checking" },
                nature,
                currency: "MXN",
                reference: None,
                is_payment_medium: true,
            },
        )
        .unwrap();
        get_account(conn, id).unwrap()
    }

    fn movement(description: &str, is_debit: bool, amount: &str) -> RawMovement {
        RawMovement {
            date: NaiveDate::from_ymd_opt(2025, 1, 5).unwrap(),
            description: description.into(),
            is_debit,
            amount: d(amount),
            running_balance: Some(d("800.00")),
            reference: None,
        }
    }

    fn classified(kind: TransactionKind, category: &str, linked: Option<&str>) -> Classification {
        Classification {
            kind,
            category: category.into(),
            linked_account: linked.map(String::from),
            confidence: 0.9,
            source: ClassificationSource::Human,
            note: None,
        }
    }

    fn post_simple(conn: &Connection, acct: &Account, m: &RawMovement, c: &Classification) -> Result<PostedGroup> {
        post(
            conn,
            &Posting { account: acct, movement: m, classification: c, batch_id: None, replaces: None },
            |_, _| Ok(()),
        )
    }

    #[test]
    fn test_bank_charge_on_checking_produces_balanced_transfer() {
        let (_dir, conn) = test_db();
        let checking = account(&conn, "Checking", AccountNature::Debtor);
        let m = movement("SPEI ENVIADO BANORTE", true, "200.00");
        let c = classified(TransactionKind::Transfer, "Transferencias", None);
        let posted = post_simple(&conn, &checking, &m, &c).unwrap();

        let legs = group_legs(&conn, &posted.group_id).unwrap();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].account_id, checking.id);
        assert_eq!(legs[0].amount, d("-200.00"));
        let counter = get_account(&conn, legs[1].account_id).unwrap();
        assert_eq!(counter.name, "Banorte - Cuenta Externa");
        assert_eq!(legs[1].amount, d("200.00"));
        assert_eq!(legs.iter().map(|l| l.amount).sum::<Decimal>(), Decimal::ZERO);

        let (origin, destination): (i64, i64) = conn
            .query_row("SELECT origin_txn_id, destination_txn_id FROM transfers", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(origin, posted.principal_id);
        assert_eq!(Some(destination), posted.counter_id);
    }

    #[test]
    fn test_bank_credit_on_checking_is_increase() {
        let (_dir, conn) = test_db();
        let checking = account(&conn, "Checking", AccountNature::Debtor);
        let m = movement("DEPOSITO NOMINA", false, "1500");
        let c = classified(TransactionKind::Income, "Salario", None);
        let posted = post_simple(&conn, &checking, &m, &c).unwrap();
        let legs = group_legs(&conn, &posted.group_id).unwrap();
        assert_eq!(legs.len(), 1);
        assert_eq!(legs[0].amount, d("1500"));
        assert_eq!(account_balance(&conn, checking.id, None).unwrap(), d("1500"));
    }

    #[test]
    fn test_charge_on_credit_card_is_negative_expense() {
        let (_dir, conn) = test_db();
        let card = account(&conn, "Tarjeta", AccountNature::Creditor);
        let m = movement("AMAZON MX", true, "80");
        let c = classified(TransactionKind::Expense, "Compras", None);
        let posted = post_simple(&conn, &card, &m, &c).unwrap();
        let legs = group_legs(&conn, &posted.group_id).unwrap();
        assert_eq!(legs[0].amount, d("-80"));
    }

    #[test]
    fn test_kind_contradicting_sign_is_rejected() {
        let (_dir, conn) = test_db();
        let checking = account(&conn, "Checking", AccountNature::Debtor);
        let m = movement("OXXO", true, "45");
        let c = classified(TransactionKind::Income, "Otros Ingresos", None);
        let err = post_simple(&conn, &checking, &m, &c).unwrap_err();
        assert!(matches!(err, CuadraError::LedgerIntegrity(_)));
        assert!(all_transactions(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_zero_amount_is_rejected() {
        let (_dir, conn) = test_db();
        let checking = account(&conn, "Checking", AccountNature::Debtor);
        let m = movement("AJUSTE", true, "0");
        let c = classified(TransactionKind::Expense, "Compras", None);
        assert!(matches!(
            post_simple(&conn, &checking, &m, &c),
            Err(CuadraError::LedgerIntegrity(_))
        ));
    }

    #[test]
    fn test_transfer_to_same_account_rolls_back() {
        let (_dir, conn) = test_db();
        let checking = account(&conn, "Checking", AccountNature::Debtor);
        let m = movement("TRASPASO", true, "100");
        let c = classified(TransactionKind::Transfer, "Transferencias", Some("checking"));
        assert!(matches!(
            post_simple(&conn, &checking, &m, &c),
            Err(CuadraError::LedgerIntegrity(_))
        ));
        assert!(all_transactions(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_transfer_without_counterparty_fails() {
        let (_dir, conn) = test_db();
        let checking = account(&conn, "Checking", AccountNature::Debtor);
        let m = movement("TRASPASO PROPIO", true, "100");
        let c = classified(TransactionKind::Transfer, "Transferencias", None);
        assert!(matches!(
            post_simple(&conn, &checking, &m, &c),
            Err(CuadraError::LedgerIntegrity(_))
        ));
    }

    #[test]
    fn test_linked_account_on_expense_is_service_account() {
        let (_dir, conn) = test_db();
        let checking = account(&conn, "Checking", AccountNature::Debtor);
        let m = movement("CFE SUMINISTRO", true, "560");
        let c = classified(TransactionKind::Expense, "Servicios", Some("CFE"));
        let posted = post_simple(&conn, &checking, &m, &c).unwrap();
        let legs = group_legs(&conn, &posted.group_id).unwrap();
        assert_eq!(legs.len(), 1);
        let service = get_account(&conn, legs[0].service_account_id.unwrap()).unwrap();
        assert_eq!(service.name, "CFE");
    }

    #[test]
    fn test_overwrite_replaces_whole_group() {
        let (_dir, conn) = test_db();
        let checking = account(&conn, "Checking", AccountNature::Debtor);
        let m = movement("SPEI ENVIADO BANORTE", true, "200.00");
        let c = classified(TransactionKind::Transfer, "Transferencias", None);
        let first = post_simple(&conn, &checking, &m, &c).unwrap();

        let expense = classified(TransactionKind::Expense, "Vivienda", None);
        let second = post(
            &conn,
            &Posting {
                account: &checking,
                movement: &m,
                classification: &expense,
                batch_id: None,
                replaces: Some(first.principal_id),
            },
            |_, _| Ok(()),
        )
        .unwrap();
        assert!(group_legs(&conn, &first.group_id).unwrap().is_empty());
        assert_eq!(all_transactions(&conn).unwrap().len(), 1);
        let transfers: i64 = conn.query_row("SELECT count(*) FROM transfers", [], |r| r.get(0)).unwrap();
        assert_eq!(transfers, 0);
        assert_eq!(group_legs(&conn, &second.group_id).unwrap()[0].amount, d("-200"));
    }

    #[test]
    fn test_unknown_category_is_created() {
        let (_dir, conn) = test_db();
        let checking = account(&conn, "Checking", AccountNature::Debtor);
        let m = movement("VETERINARIA", true, "300");
        let c = classified(TransactionKind::Expense, "Mascotas", None);
        post_simple(&conn, &checking, &m, &c).unwrap();
        assert!(catalog::get_category_by_name(&conn, "Mascotas").unwrap().is_some());
    }

    #[test]
    fn test_balance_as_of() {
        let (_dir, conn) = test_db();
        let checking = account(&conn, "Checking", AccountNature::Debtor);
        let c = classified(TransactionKind::Income, "Salario", None);
        post_simple(&conn, &checking, &movement("NOMINA", false, "1000"), &c).unwrap();
        let mut later = movement("NOMINA", false, "500");
        later.date = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();
        post_simple(&conn, &checking, &later, &c).unwrap();
        let jan = NaiveDate::from_ymd_opt(2025, 1, 31).unwrap();
        assert_eq!(account_balance(&conn, checking.id, Some(jan)).unwrap(), d("1000"));
        assert_eq!(account_balance(&conn, checking.id, None).unwrap(), d("1500"));
    }

    #[test]
    fn test_failed_record_rolls_back_the_legs() {
        let (_dir, conn) = test_db();
        let checking = account(&conn, "Checking", AccountNature::Debtor);
        let m = movement("SPEI ENVIADO BANORTE", true, "200.00");
        let c = classified(TransactionKind::Transfer, "Transferencias", None);
        let result = post(
            &conn,
            &Posting { account: &checking, movement: &m, classification: &c, batch_id: None, replaces: None },
            |_, _| Err(CuadraError::Other("bookkeeping failed".into())),
        );
        assert!(result.is_err());
        assert!(all_transactions(&conn).unwrap().is_empty());
        let transfers: i64 = conn.query_row("SELECT count(*) FROM transfers", [], |r| r.get(0)).unwrap();
        assert_eq!(transfers, 0);
    }

    #[test]
    fn test_corrupt_kind_is_an_integrity_error() {
        let (_dir, conn) = test_db();
        let checking = account(&conn, "Checking", AccountNature::Debtor);
        let c = classified(TransactionKind::Expense, "Vivienda", None);
        let posted = post_simple(&conn, &checking, &movement("RENTA", true, "8000"), &c).unwrap();
        conn.execute_batch("PRAGMA ignore_check_constraints = ON").unwrap();
        conn.execute("UPDATE transactions SET kind = 'GIFT' WHERE id = ?1", [posted.principal_id])
            .unwrap();
        assert!(matches!(group_legs(&conn, &posted.group_id), Err(CuadraError::LedgerIntegrity(_))));
        assert!(matches!(all_transactions(&conn), Err(CuadraError::LedgerIntegrity(_))));
    }
}
