use chrono::Local;
use colored::Colorize;
use comfy_table::{Cell, Table};
use rust_decimal::Decimal;

use crate::cli::open_memory;
use crate::error::{CuadraError, Result};
use crate::fmt::percent;
use crate::models::RawMovement;
use crate::settings::load_settings;
use crate::statement::{clean_amount, extract_reference};

pub fn stats() -> Result<()> {
    let settings = load_settings();
    let memory = open_memory(&settings);
    let stats = memory.stats();

    println!("Memory:      {}", memory.path().display());
    let mut table = Table::new();
    table.set_header(vec!["Pattern type", "Count"]);
    for (ty, count) in &stats.per_type {
        table.add_row(vec![Cell::new(ty), Cell::new(count)]);
    }
    println!("{table}");
    println!("Total patterns:        {}", stats.total_patterns);
    println!("Human validated:       {}", stats.human_validated);
    println!("Average confidence:    {}", percent(stats.average_confidence));
    println!("Learned transactions:  {}", stats.total_learned_transactions);
    Ok(())
}

pub fn show(description: &str, amount: Option<&str>) -> Result<()> {
    let signed = match amount {
        Some(raw) => clean_amount(raw).ok_or_else(|| CuadraError::Other(format!("Invalid amount: {raw}")))?,
        None => Decimal::ZERO,
    };
    let movement = RawMovement {
        date: Local::now().date_naive(),
        description: description.to_string(),
        is_debit: signed.is_sign_negative(),
        amount: signed.abs(),
        running_balance: None,
        reference: extract_reference(description),
    };

    let settings = load_settings();
    let memory = open_memory(&settings);
    let matches = memory.find_matches(&movement);
    if matches.is_empty() {
        println!("{}", "No learned patterns match.".dimmed());
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Type", "ID", "Kind", "Category", "Linked", "Confidence", "Seen", "Validated"]);
    for m in matches {
        table.add_row(vec![
            Cell::new(m.pattern_type),
            Cell::new(m.pattern_id),
            Cell::new(m.classification.kind),
            Cell::new(m.classification.category),
            Cell::new(m.classification.linked_account.unwrap_or_default()),
            Cell::new(percent(m.confidence)),
            Cell::new(m.frequency),
            Cell::new(if m.human_validated { "yes" } else { "" }),
        ]);
    }
    println!("Matching patterns\n{table}");
    Ok(())
}

pub fn backup() -> Result<()> {
    let settings = load_settings();
    let memory = open_memory(&settings);
    let dest = memory.backup()?;
    println!("Pattern memory saved to {}", dest.display());
    Ok(())
}
