use comfy_table::{Cell, Table};

use crate::catalog;
use crate::categorizer;
use crate::cli::open_db;
use crate::error::{CuadraError, Result};
use crate::models::TransactionKind;

const MATCH_TYPES: &[&str] = &["contains", "starts_with", "regex"];

pub fn add(
    pattern: &str,
    category: &str,
    kind: &str,
    match_type: &str,
    priority: i64,
    linked_account: Option<&str>,
) -> Result<()> {
    if !MATCH_TYPES.contains(&match_type) {
        return Err(CuadraError::Other(format!(
            "Invalid match type: {match_type} (must be one of {})",
            MATCH_TYPES.join(", ")
        )));
    }
    let kind: TransactionKind = kind.parse()?;
    let (_, conn) = open_db()?;
    let cat = catalog::require_category(&conn, category)?;
    let id = categorizer::add_rule(&conn, pattern, match_type, kind, cat.id, linked_account, priority)?;
    println!("Added rule {id}: '{pattern}' \u{2192} {kind} / {}", cat.name);
    Ok(())
}

pub fn list() -> Result<()> {
    let (_, conn) = open_db()?;
    let rules = categorizer::active_rules(&conn)?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Pattern", "Match", "Kind", "Category", "Linked", "Priority", "Hits"]);
    for r in rules {
        table.add_row(vec![
            Cell::new(r.id),
            Cell::new(r.pattern),
            Cell::new(r.match_type),
            Cell::new(r.kind),
            Cell::new(r.category),
            Cell::new(r.linked_account.unwrap_or_default()),
            Cell::new(r.priority),
            Cell::new(r.hit_count),
        ]);
    }
    println!("Rules\n{table}");
    Ok(())
}

pub fn delete(id: i64) -> Result<()> {
    let (_, conn) = open_db()?;
    if !categorizer::deactivate_rule(&conn, id)? {
        return Err(CuadraError::Other(format!("No active rule with ID {id}")));
    }
    println!("Deleted rule {id}");
    Ok(())
}
