use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rusqlite::Connection;
use rust_decimal::Decimal;

use crate::db::decimal_column;
use crate::error::{CuadraError, Result};
use crate::models::RawMovement;

/// Batch-wide answer to "what do we do with duplicates?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    SkipAll,
    OverwriteAll,
    PerItem,
}

impl DuplicatePolicy {
    /// The per-item decision wins; otherwise the batch policy decides, and
    /// `PerItem` leaves the question open.
    pub fn decide(&self, per_item: Option<DuplicateDecision>) -> Option<DuplicateDecision> {
        per_item.or(match self {
            Self::SkipAll => Some(DuplicateDecision::Skip),
            Self::OverwriteAll => Some(DuplicateDecision::Overwrite),
            Self::PerItem => None,
        })
    }
}

impl FromStr for DuplicatePolicy {
    type Err = CuadraError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "skip" | "skip_all" => Ok(Self::SkipAll),
            "overwrite" | "overwrite_all" => Ok(Self::OverwriteAll),
            "ask" | "per_item" => Ok(Self::PerItem),
            other => Err(CuadraError::Other(format!(
                "Invalid duplicate policy: {other} (must be skip, overwrite or ask)"
            ))),
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SkipAll => "skip",
            Self::OverwriteAll => "overwrite",
            Self::PerItem => "ask",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateDecision {
    Skip,
    Overwrite,
    /// Keep both: import the movement as new.
    Import,
}

struct Candidate {
    id: i64,
    amount: Decimal,
    reference: Option<String>,
    description: String,
}

fn same_day_transactions(conn: &Connection, date: NaiveDate) -> Result<Vec<Candidate>> {
    let mut stmt = conn.prepare(
        "SELECT id, amount, bank_reference, COALESCE(bank_description, description) \
         FROM transactions WHERE date = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([date], |row| {
            Ok(Candidate {
                id: row.get(0)?,
                amount: decimal_column(row, 1)?,
                reference: row.get(2)?,
                description: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Existing transaction recording the same event: same date, same absolute
/// amount. A reference narrows the match: rows with a different reference
/// are excluded and rows with the same one are preferred. Transactions in
/// `claimed` already stand for another movement and never match.
pub fn find_duplicate(
    conn: &Connection,
    date: NaiveDate,
    amount: Decimal,
    reference: Option<&str>,
    claimed: &HashSet<i64>,
) -> Result<Option<i64>> {
    let target = amount.abs();
    let candidates: Vec<Candidate> = same_day_transactions(conn, date)?
        .into_iter()
        .filter(|c| c.amount.abs() == target && !claimed.contains(&c.id))
        .collect();

    let Some(reference) = reference else {
        return Ok(candidates.first().map(|c| c.id));
    };
    let same_ref = candidates.iter().find(|c| {
        c.reference
            .as_deref()
            .map(|r| r.eq_ignore_ascii_case(reference))
            .unwrap_or(false)
    });
    if let Some(c) = same_ref {
        return Ok(Some(c.id));
    }
    Ok(candidates.iter().find(|c| c.reference.is_none()).map(|c| c.id))
}

/// Duplicate check for every movement of a batch, in order. Each existing
/// transaction is matched by at most one movement, so repeated identical
/// rows only claim as many ledger rows as there are.
pub fn prescan(conn: &Connection, movements: &[RawMovement]) -> Result<Vec<Option<i64>>> {
    let mut claimed = HashSet::new();
    let mut found = Vec::with_capacity(movements.len());
    for m in movements {
        let hit = find_duplicate(conn, m.date, m.amount, m.reference.as_deref(), &claimed)?;
        if let Some(id) = hit {
            claimed.insert(id);
        }
        found.push(hit);
    }
    let count = found.iter().filter(|f| f.is_some()).count();
    if count > 0 {
        tracing::warn!(duplicates = count, total = movements.len(), "Duplicate movements found");
    }
    Ok(found)
}

fn normalize_description(s: &str) -> Vec<char> {
    s.to_uppercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .collect()
}

/// 2 * LCS / (len_a + len_b) over normalized descriptions, in [0, 1].
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a = normalize_description(a);
    let b = normalize_description(b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let lcs = prev[b.len()];
    2.0 * lcs as f64 / (a.len() + b.len()) as f64
}

/// Ledger rows a staged movement must not be matched against: rows already
/// claimed by other movements of its batch, and rows its own batch posted.
pub fn claimed_by_batch(conn: &Connection, batch_id: i64, staged_id: i64) -> Result<HashSet<i64>> {
    let mut stmt = conn.prepare(
        "SELECT duplicate_of FROM staged_movements \
         WHERE batch_id = ?1 AND id <> ?2 AND duplicate_of IS NOT NULL \
         UNION SELECT id FROM transactions WHERE batch_id = ?1",
    )?;
    let ids = stmt
        .query_map([batch_id, staged_id], |row| row.get::<_, i64>(0))?
        .collect::<std::result::Result<HashSet<i64>, _>>()?;
    Ok(ids)
}

/// Single-statement path: a same-day, same-amount transaction whose
/// description is at least `threshold` similar and not yet `claimed`.
pub fn find_similar(
    conn: &Connection,
    movement: &RawMovement,
    threshold: f64,
    claimed: &HashSet<i64>,
) -> Result<Option<(i64, f64)>> {
    let target = movement.amount.abs();
    let best = same_day_transactions(conn, movement.date)?
        .into_iter()
        .filter(|c| c.amount.abs() == target && !claimed.contains(&c.id))
        .map(|c| (c.id, similarity_ratio(&movement.description, &c.description)))
        .filter(|(_, ratio)| *ratio >= threshold)
        .max_by(|a, b| a.1.total_cmp(&b.1));
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn none() -> HashSet<i64> {
        HashSet::new()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 5).unwrap()
    }

    fn insert_txn(conn: &Connection, amount: &str, reference: Option<&str>, description: &str) -> i64 {
        conn.execute(
            "INSERT OR IGNORE INTO accounts (id, name, account_type, nature) VALUES (1, 'Cheques', 'checking', 'DEUDORA')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO transactions (group_id, account_id, kind, amount, date, description, bank_reference) \
             VALUES ('g', 1, 'EXPENSE', ?1, ?2, ?3, ?4)",
            rusqlite::params![amount, date(), description, reference],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn test_sign_agnostic_match() {
        let (_dir, conn) = test_db();
        let id = insert_txn(&conn, "-200", None, "SPEI ENVIADO");
        assert_eq!(find_duplicate(&conn, date(), d("200.00"), None, &none()).unwrap(), Some(id));
        assert_eq!(find_duplicate(&conn, date(), d("-200"), None, &none()).unwrap(), Some(id));
        assert_eq!(find_duplicate(&conn, date(), d("201"), None, &none()).unwrap(), None);
        let other_day = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        assert_eq!(find_duplicate(&conn, other_day, d("200"), None, &none()).unwrap(), None);
    }

    #[test]
    fn test_reference_narrows_match() {
        let (_dir, conn) = test_db();
        let a = insert_txn(&conn, "-200", Some("REF0001"), "SPEI A");
        let b = insert_txn(&conn, "-200", Some("REF0002"), "SPEI B");
        assert_eq!(find_duplicate(&conn, date(), d("200"), Some("ref0002"), &none()).unwrap(), Some(b));
        assert_eq!(find_duplicate(&conn, date(), d("200"), Some("REF0001"), &none()).unwrap(), Some(a));
        assert_eq!(find_duplicate(&conn, date(), d("200"), Some("REF9999"), &none()).unwrap(), None);
    }

    #[test]
    fn test_reference_falls_back_to_unreferenced_rows() {
        let (_dir, conn) = test_db();
        let id = insert_txn(&conn, "45.50", None, "OXXO");
        assert_eq!(find_duplicate(&conn, date(), d("45.5"), Some("AUT1234"), &none()).unwrap(), Some(id));
    }

    #[test]
    fn test_policy_per_item_wins() {
        assert_eq!(DuplicatePolicy::SkipAll.decide(None), Some(DuplicateDecision::Skip));
        assert_eq!(
            DuplicatePolicy::SkipAll.decide(Some(DuplicateDecision::Import)),
            Some(DuplicateDecision::Import)
        );
        assert_eq!(DuplicatePolicy::PerItem.decide(None), None);
        assert_eq!("overwrite".parse::<DuplicatePolicy>().unwrap(), DuplicatePolicy::OverwriteAll);
        assert!("maybe".parse::<DuplicatePolicy>().is_err());
    }

    #[test]
    fn test_similarity_ratio() {
        assert_eq!(similarity_ratio("OXXO CENTRO", "oxxo  centro"), 1.0);
        assert!(similarity_ratio("SPEI ENVIADO BANORTE", "SPEI ENVIADO BANORTE 01") > 0.85);
        assert!(similarity_ratio("NETFLIX", "CFE SUMINISTRO") < 0.5);
        assert_eq!(similarity_ratio("", "X"), 0.0);
    }

    #[test]
    fn test_find_similar_uses_threshold() {
        let (_dir, conn) = test_db();
        let id = insert_txn(&conn, "-389", None, "PAGO TELMEX");
        let movement = RawMovement {
            date: date(),
            description: "PAGO TELMEX.".into(),
            is_debit: true,
            amount: d("389"),
            running_balance: None,
            reference: None,
        };
        let (found, ratio) = find_similar(&conn, &movement, 0.85, &none()).unwrap().unwrap();
        assert_eq!(found, id);
        assert!(ratio > 0.9);
        let unrelated = RawMovement { description: "RETIRO CAJERO".into(), ..movement };
        assert!(find_similar(&conn, &unrelated, 0.85, &none()).unwrap().is_none());
    }

    #[test]
    fn test_prescan_flags_in_order() {
        let (_dir, conn) = test_db();
        let id = insert_txn(&conn, "-389", None, "PAGO TELMEX");
        let mk = |amount: &str| RawMovement {
            date: date(),
            description: "X".into(),
            is_debit: true,
            amount: d(amount),
            running_balance: None,
            reference: None,
        };
        let found = prescan(&conn, &[mk("10"), mk("389")]).unwrap();
        assert_eq!(found, vec![None, Some(id)]);
    }

    #[test]
    fn test_repeated_rows_claim_each_transaction_once() {
        let (_dir, conn) = test_db();
        let id = insert_txn(&conn, "-50", None, "CAFE");
        let coffee = RawMovement {
            date: date(),
            description: "CAFE".into(),
            is_debit: true,
            amount: d("50.00"),
            running_balance: None,
            reference: None,
        };
        let found = prescan(&conn, &[coffee.clone(), coffee.clone()]).unwrap();
        assert_eq!(found, vec![Some(id), None]);

        let second = insert_txn(&conn, "-50", None, "CAFE");
        let found = prescan(&conn, &[coffee.clone(), coffee.clone(), coffee]).unwrap();
        assert_eq!(found, vec![Some(id), Some(second), None]);
    }

    #[test]
    fn test_claimed_transactions_are_skipped() {
        let (_dir, conn) = test_db();
        let id = insert_txn(&conn, "-200", None, "SPEI ENVIADO");
        let claimed: HashSet<i64> = [id].into_iter().collect();
        assert_eq!(find_duplicate(&conn, date(), d("200"), None, &claimed).unwrap(), None);
    }
}
