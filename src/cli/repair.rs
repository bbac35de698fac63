use chrono::NaiveDate;
use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::cli::open_db;
use crate::error::{CuadraError, Result};
use crate::fmt::money;
use crate::reconciler::{self, GroupStatus};
use crate::statement::clean_amount;

fn status_label(status: GroupStatus) -> &'static str {
    match status {
        GroupStatus::Balanced => "balanced",
        GroupStatus::Orphan => "orphan",
        GroupStatus::Unbalanced => "unbalanced",
    }
}

pub fn scan() -> Result<()> {
    let (_, conn) = open_db()?;
    let report = reconciler::scan(&conn)?;

    println!("Balanced transfers:  {}", report.balanced);
    println!("Simple entries:      {}", report.simple);
    println!("Orphaned transfers:  {}", report.orphans());
    println!("Unbalanced groups:   {}", report.unbalanced());

    if report.issues.is_empty() {
        println!("{}", "Ledger is balanced.".green());
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Group", "Status", "Legs", "Sum", "Description"]);
    for issue in &report.issues {
        let description = issue
            .legs
            .first()
            .map(|l| l.description.chars().take(40).collect::<String>())
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(&issue.group_id),
            Cell::new(status_label(issue.status)),
            Cell::new(issue.legs.len()),
            Cell::new(money(issue.sum)),
            Cell::new(description),
        ]);
    }
    println!("{table}");
    println!("{}", "Run `cuadra repair fix` to regenerate counter-legs.".yellow());
    Ok(())
}

pub fn fix(dry_run: bool) -> Result<()> {
    let (_, conn) = open_db()?;
    let report = reconciler::fix(&conn, dry_run)?;

    if report.repairs.is_empty() && report.failures.is_empty() {
        println!("{}", "Nothing to repair.".green());
        return Ok(());
    }

    if !report.repairs.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Group", "Status", "Principal", "Removed", "Counter account", "Counter amount"]);
        for r in &report.repairs {
            let removed: Vec<String> = r.removed.iter().map(|id| id.to_string()).collect();
            table.add_row(vec![
                Cell::new(&r.group_id),
                Cell::new(status_label(r.status)),
                Cell::new(r.principal_id),
                Cell::new(removed.join(", ")),
                Cell::new(&r.counter_account),
                Cell::new(money(r.counter_amount)),
            ]);
        }
        let title = if dry_run { "Planned repairs (dry run)" } else { "Repairs" };
        println!("{title}\n{table}");
    }

    for (group_id, reason) in &report.failures {
        println!("{}", format!("  {group_id}: {reason}").red());
    }
    if dry_run {
        println!("{}", "No changes written.".yellow());
    } else {
        println!("Repaired {} groups.", report.repairs.len());
    }
    Ok(())
}

pub fn balance(account: &str, as_of: &str, statement_balance: &str) -> Result<()> {
    let as_of = NaiveDate::parse_from_str(as_of, "%Y-%m-%d")
        .map_err(|_| CuadraError::Other(format!("Invalid date: {as_of} (expected YYYY-MM-DD)")))?;
    let statement_balance = clean_amount(statement_balance)
        .ok_or_else(|| CuadraError::Other(format!("Invalid balance: {statement_balance}")))?;
    let (_, conn) = open_db()?;
    let check = reconciler::check_balance(&conn, account, as_of, statement_balance)?;

    println!("Statement balance:   {}", money(check.statement_balance));
    println!("Calculated balance:  {}", money(check.calculated_balance));
    if check.is_reconciled {
        println!(
            "{}",
            format!("Reconciled. {} transactions marked.", check.marked).green()
        );
    } else {
        println!("{}", format!("Discrepancy: {}", money(check.discrepancy)).red());
    }
    Ok(())
}
