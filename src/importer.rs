use std::collections::HashSet;
use std::path::Path;

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::catalog;
use crate::categorizer;
use crate::db::{decimal_column, decimal_to_sql, optional_decimal_column};
use crate::dedupe;
use crate::engine::{Engine, Outcome};
use crate::error::{CuadraError, Result};
use crate::memory::{PatternDefinition, PatternType};
use crate::models::{
    Classification, ClassificationSource, ImportBatch, RawMovement, ReviewState, StagedMovement,
};
use crate::statement;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn compute_checksum(file_path: &Path) -> Result<String> {
    let data = std::fs::read(file_path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

fn already_imported(conn: &Connection, checksum: &str, account_id: i64) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM import_batches WHERE checksum = ?1 AND account_id = ?2 ORDER BY id LIMIT 1",
            rusqlite::params![checksum, account_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct StageOptions {
    /// Stage the file even if an identical file was imported before.
    pub force: bool,
    /// Single-statement path: rules only, duplicates flagged by description
    /// similarity.
    pub legacy: bool,
}

#[derive(Debug, Default)]
pub struct StageResult {
    pub batch_id: Option<i64>,
    pub staged: usize,
    pub duplicates: usize,
    pub dropped: usize,
    pub warnings: Vec<String>,
    /// Set when the file was imported before and `force` was not given.
    pub duplicate_file: Option<i64>,
}

/// Parse `file_path`, classify every movement and stage the lot for review.
/// Parsing problems abort before anything is written; classification
/// failures fall back per movement.
pub fn stage_file(
    conn: &Connection,
    engine: &Engine<'_>,
    file_path: &Path,
    account_name: &str,
    options: StageOptions,
) -> Result<StageResult> {
    let account = catalog::require_account(conn, account_name)?;
    if !account.is_active {
        return Err(CuadraError::UnknownAccount(format!("{} (inactive)", account.name)));
    }

    let checksum = compute_checksum(file_path)?;
    if !options.force {
        if let Some(batch) = already_imported(conn, &checksum, account.id)? {
            return Ok(StageResult { duplicate_file: Some(batch), ..Default::default() });
        }
    }

    let parsed = statement::parse_statement(file_path)?;
    info!(
        file = %file_path.display(),
        movements = parsed.movements.len(),
        dropped = parsed.dropped,
        "Parsed statement"
    );

    let duplicates: Vec<Option<i64>> = if options.legacy {
        let threshold = engine.thresholds().similarity;
        let mut claimed = HashSet::new();
        let mut found = Vec::with_capacity(parsed.movements.len());
        for m in &parsed.movements {
            let hit = dedupe::find_similar(conn, m, threshold, &claimed)?.map(|(id, _)| id);
            claimed.extend(hit);
            found.push(hit);
        }
        found
    } else {
        dedupe::prescan(conn, &parsed.movements)?
    };

    let outcomes: Vec<Outcome> = parsed
        .movements
        .iter()
        .map(|m| classify_one(conn, engine, m, options.legacy))
        .collect::<Result<_>>()?;

    let filename = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_string();

    let tx = conn.unchecked_transaction()?;
    let batch_id = insert_batch(&tx, &filename, account.id, &checksum, &parsed.movements)?;
    for (idx, ((movement, outcome), duplicate_of)) in parsed
        .movements
        .iter()
        .zip(&outcomes)
        .zip(&duplicates)
        .enumerate()
    {
        insert_staged(&tx, batch_id, idx as i64, movement, outcome, *duplicate_of)?;
    }
    tx.commit()?;

    let duplicate_count = duplicates.iter().filter(|d| d.is_some()).count();
    info!(batch = batch_id, staged = outcomes.len(), duplicates = duplicate_count, "Staged import batch");
    Ok(StageResult {
        batch_id: Some(batch_id),
        staged: outcomes.len(),
        duplicates: duplicate_count,
        dropped: parsed.dropped,
        warnings: parsed.warnings,
        duplicate_file: None,
    })
}

fn classify_one(conn: &Connection, engine: &Engine<'_>, movement: &RawMovement, legacy: bool) -> Result<Outcome> {
    let result = if legacy {
        categorizer::classify(conn, movement).map(|classification| Outcome {
            classification,
            suggestion: None,
            matches: Vec::new(),
        })
    } else {
        engine.classify(movement)
    };
    match result {
        Ok(outcome) => Ok(outcome),
        Err(e) if e.is_movement_scoped() => {
            warn!(movement = %movement.locator(), error = %e, "Classification failed, using fallback");
            let mut classification = Classification::fallback(movement.signed_amount());
            classification.note = Some(e.to_string());
            Ok(Outcome { classification, suggestion: None, matches: Vec::new() })
        }
        Err(e) => Err(e),
    }
}

fn insert_batch(
    conn: &Connection,
    filename: &str,
    account_id: i64,
    checksum: &str,
    movements: &[RawMovement],
) -> Result<i64> {
    let total_debit: Decimal = movements.iter().filter(|m| m.is_debit).map(|m| m.amount).sum();
    let total_credit: Decimal = movements.iter().filter(|m| !m.is_debit).map(|m| m.amount).sum();
    let first = movements.iter().map(|m| m.date).min();
    let last = movements.iter().map(|m| m.date).max();
    conn.execute(
        "INSERT INTO import_batches (filename, account_id, checksum, movement_count, total_debit, \
         total_credit, first_date, last_date) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            filename,
            account_id,
            checksum,
            movements.len() as i64,
            decimal_to_sql(total_debit),
            decimal_to_sql(total_credit),
            first,
            last,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_staged(
    conn: &Connection,
    batch_id: i64,
    row_index: i64,
    movement: &RawMovement,
    outcome: &Outcome,
    duplicate_of: Option<i64>,
) -> Result<()> {
    let c = &outcome.classification;
    let (pattern_type, pattern_id) = match c.memory_pattern() {
        Some((ty, id)) => (Some(ty.as_str()), Some(id.to_string())),
        None => (None, None),
    };
    let suggestion = outcome
        .suggestion
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO staged_movements (batch_id, row_index, date, description, is_debit, amount, \
         running_balance, reference, kind, category, linked_account, confidence, source, \
         pattern_type, pattern_id, note, pattern_suggestion, duplicate_of) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        rusqlite::params![
            batch_id,
            row_index,
            movement.date,
            movement.description,
            movement.is_debit as i64,
            decimal_to_sql(movement.amount),
            movement.running_balance.map(decimal_to_sql),
            movement.reference,
            c.kind.as_str(),
            c.category,
            c.linked_account,
            c.confidence,
            c.source.as_str(),
            pattern_type,
            pattern_id,
            c.note,
            suggestion,
            duplicate_of,
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Staged rows
// ---------------------------------------------------------------------------

const STAGED_COLUMNS: &str = "id, batch_id, row_index, date, description, is_debit, amount, running_balance, \
     reference, kind, category, linked_account, confidence, source, pattern_type, pattern_id, note, \
     pattern_suggestion, duplicate_of, state, error, group_id";

fn source_from_columns(source: &str, pattern_type: Option<String>, pattern_id: Option<String>) -> ClassificationSource {
    match source {
        "memory" => match (pattern_type.and_then(|t| t.parse::<PatternType>().ok()), pattern_id) {
            (Some(pattern_type), Some(pattern_id)) => ClassificationSource::Memory { pattern_type, pattern_id },
            _ => ClassificationSource::Rule,
        },
        "ai" => ClassificationSource::Ai,
        "fallback" => ClassificationSource::Fallback,
        "human" => ClassificationSource::Human,
        _ => ClassificationSource::Rule,
    }
}

fn staged_from_row(row: &Row<'_>) -> rusqlite::Result<StagedMovement> {
    let kind: String = row.get(9)?;
    let source: String = row.get(13)?;
    let suggestion: Option<String> = row.get(17)?;
    let state: String = row.get(19)?;
    let movement = RawMovement {
        date: row.get(3)?,
        description: row.get(4)?,
        is_debit: row.get::<_, i64>(5)? != 0,
        amount: decimal_column(row, 6)?,
        running_balance: optional_decimal_column(row, 7)?,
        reference: row.get(8)?,
    };
    let kind = kind
        .parse()
        .unwrap_or_else(|_| crate::models::TransactionKind::from_cash_flow(movement.signed_amount()));
    Ok(StagedMovement {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        row_index: row.get(2)?,
        classification: Classification {
            kind,
            category: row.get(10)?,
            linked_account: row.get(11)?,
            confidence: row.get(12)?,
            source: source_from_columns(&source, row.get(14)?, row.get(15)?),
            note: row.get(16)?,
        },
        movement,
        suggestion: suggestion.and_then(|s| serde_json::from_str::<PatternDefinition>(&s).ok()),
        duplicate_of: row.get(18)?,
        state: ReviewState::parse(&state),
        error: row.get(20)?,
        group_id: row.get(21)?,
    })
}

pub fn staged_movements(conn: &Connection, batch_id: i64) -> Result<Vec<StagedMovement>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STAGED_COLUMNS} FROM staged_movements WHERE batch_id = ?1 ORDER BY row_index"
    ))?;
    let rows = stmt
        .query_map([batch_id], staged_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn pending_movements(conn: &Connection, batch_id: i64) -> Result<Vec<StagedMovement>> {
    Ok(staged_movements(conn, batch_id)?
        .into_iter()
        .filter(|s| s.state == ReviewState::Pending)
        .collect())
}

pub fn update_classification(conn: &Connection, staged_id: i64, c: &Classification) -> Result<()> {
    let (pattern_type, pattern_id) = match c.memory_pattern() {
        Some((ty, id)) => (Some(ty.as_str()), Some(id.to_string())),
        None => (None, None),
    };
    conn.execute(
        "UPDATE staged_movements SET kind = ?1, category = ?2, linked_account = ?3, confidence = ?4, \
         source = ?5, pattern_type = ?6, pattern_id = ?7, note = ?8 WHERE id = ?9",
        rusqlite::params![
            c.kind.as_str(),
            c.category,
            c.linked_account,
            c.confidence,
            c.source.as_str(),
            pattern_type,
            pattern_id,
            c.note,
            staged_id,
        ],
    )?;
    Ok(())
}

/// Record that the staged row matches an existing ledger transaction.
pub fn set_duplicate_of(conn: &Connection, staged_id: i64, existing: i64) -> Result<()> {
    conn.execute(
        "UPDATE staged_movements SET duplicate_of = ?1 WHERE id = ?2",
        [existing, staged_id],
    )?;
    Ok(())
}

pub fn set_state(
    conn: &Connection,
    staged_id: i64,
    state: ReviewState,
    error: Option<&str>,
    group_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE staged_movements SET state = ?1, error = ?2, group_id = ?3 WHERE id = ?4",
        rusqlite::params![state.as_str(), error, group_id, staged_id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

const BATCH_COLUMNS: &str = "id, filename, account_id, checksum, movement_count, total_debit, total_credit, \
     first_date, last_date, processed, skipped, errored, status";

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<ImportBatch> {
    Ok(ImportBatch {
        id: row.get(0)?,
        filename: row.get(1)?,
        account_id: row.get(2)?,
        checksum: row.get(3)?,
        movement_count: row.get(4)?,
        total_debit: decimal_column(row, 5)?,
        total_credit: decimal_column(row, 6)?,
        first_date: row.get::<_, Option<NaiveDate>>(7)?,
        last_date: row.get::<_, Option<NaiveDate>>(8)?,
        processed: row.get(9)?,
        skipped: row.get(10)?,
        errored: row.get(11)?,
        status: row.get(12)?,
    })
}

pub fn get_batch(conn: &Connection, batch_id: i64) -> Result<ImportBatch> {
    conn.query_row(
        &format!("SELECT {BATCH_COLUMNS} FROM import_batches WHERE id = ?1"),
        [batch_id],
        batch_from_row,
    )
    .optional()?
    .ok_or_else(|| CuadraError::Other(format!("No import batch #{batch_id}")))
}

/// Batches that still have movements awaiting review, oldest first.
pub fn open_batches(conn: &Connection) -> Result<Vec<ImportBatch>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {BATCH_COLUMNS} FROM import_batches b WHERE EXISTS \
         (SELECT 1 FROM staged_movements s WHERE s.batch_id = b.id AND s.state = 'pending') ORDER BY id"
    ))?;
    let rows = stmt
        .query_map([], batch_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Recompute a batch's outcome counters from its staged rows.
pub fn refresh_batch_stats(conn: &Connection, batch_id: i64) -> Result<ImportBatch> {
    let (processed, skipped, errored, pending): (i64, i64, i64, i64) = conn.query_row(
        "SELECT \
           COALESCE(SUM(state IN ('confirmed', 'corrected')), 0), \
           COALESCE(SUM(state = 'ignored' AND error IS NULL), 0), \
           COALESCE(SUM(error IS NOT NULL), 0), \
           COALESCE(SUM(state = 'pending'), 0) \
         FROM staged_movements WHERE batch_id = ?1",
        [batch_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
    )?;
    let status = if pending == 0 { "completed" } else { "staged" };
    conn.execute(
        "UPDATE import_batches SET processed = ?1, skipped = ?2, errored = ?3, status = ?4 WHERE id = ?5",
        rusqlite::params![processed, skipped, errored, status, batch_id],
    )?;
    get_batch(conn, batch_id)
}
