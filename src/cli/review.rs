use colored::Colorize;
use comfy_table::{Cell, Table};
use dialoguer::{Input, Select};
use rusqlite::Connection;

use crate::catalog;
use crate::cli::{open_db, open_memory};
use crate::dedupe::{DuplicateDecision, DuplicatePolicy};
use crate::error::Result;
use crate::fmt::{money, percent};
use crate::importer;
use crate::memory::{Feedback, PatternMemory};
use crate::models::{Classification, ReviewState, StagedMovement, TransactionKind};
use crate::reviewer::{corrected, transition, Action, BatchReport, Resolution, Reviewer, Step};
use crate::settings::Settings;

/// Lookup lists offered while correcting a movement.
struct Choices {
    categories: Vec<String>,
    accounts: Vec<String>,
}

pub fn run(batch: Option<i64>, policy: Option<String>) -> Result<()> {
    let (settings, conn) = open_db()?;
    let batches = match batch {
        Some(id) => vec![importer::get_batch(&conn, id)?],
        None => importer::open_batches(&conn)?,
    };
    let mut pending = Vec::new();
    for b in batches {
        let rows = importer::pending_movements(&conn, b.id)?;
        if !rows.is_empty() {
            pending.push((b, rows));
        }
    }
    if pending.is_empty() {
        println!("{}", "No pending movements to review.".green());
        return Ok(());
    }

    let has_duplicates = pending
        .iter()
        .any(|(_, rows)| rows.iter().any(|s| s.duplicate_of.is_some()));
    let policy = match policy {
        Some(p) => p.parse::<DuplicatePolicy>()?,
        None if has_duplicates => ask_policy(),
        None => DuplicatePolicy::SkipAll,
    };

    let mut memory = open_memory(&settings);
    for (b, rows) in &pending {
        println!("\n{} ({} pending)", b.filename.bold(), rows.len());
        if !review_batch(&conn, &mut memory, &settings, b.id, policy)? {
            break;
        }
    }
    Ok(())
}

/// Ask how duplicates in the batch should be handled. A closed terminal
/// falls back to skipping them.
pub(crate) fn ask_policy() -> DuplicatePolicy {
    let items = [
        "Skip all duplicates",
        "Overwrite all duplicates",
        "Decide one by one",
    ];
    let choice = Select::new()
        .with_prompt("Some movements look like transactions already in the ledger")
        .items(&items)
        .default(0)
        .interact()
        .unwrap_or(0);
    match choice {
        1 => DuplicatePolicy::OverwriteAll,
        2 => DuplicatePolicy::PerItem,
        _ => DuplicatePolicy::SkipAll,
    }
}

/// Walk one batch through the wizard. Returns false when the operator left
/// early.
pub(crate) fn review_batch(
    conn: &Connection,
    memory: &mut PatternMemory,
    settings: &Settings,
    batch_id: i64,
    policy: DuplicatePolicy,
) -> Result<bool> {
    let choices = Choices {
        categories: catalog::list_categories(conn)?.into_iter().map(|c| c.name).collect(),
        accounts: catalog::account_names(conn)?,
    };
    let mut reviewer = Reviewer::for_batch(conn, memory, batch_id, policy)?;
    let report = reviewer.run(batch_id, Some(settings.thresholds.auto_confirm), |r, staged| {
        prompt_movement(r, staged, &choices)
    })?;
    print_report(&report);
    Ok(!report.exited_early)
}

fn show_movement(reviewer: &Reviewer<'_>, staged: &StagedMovement) {
    let m = &staged.movement;
    let c = &staged.classification;
    let amount = m.signed_amount();
    let amount_str = if amount.is_sign_negative() {
        money(amount).red().to_string()
    } else {
        money(amount).green().to_string()
    };
    println!("{}", "\u{2500}".repeat(60));
    println!("  Date:        {}", m.date);
    println!("  Description: {}", m.description);
    println!("  Amount:      {amount_str}");
    println!("  Account:     {}", reviewer.account().name);
    if let Some(reference) = &m.reference {
        println!("  Reference:   {reference}");
    }
    println!(
        "  Suggested:   {} / {} ({}, {})",
        c.kind,
        c.category.bold(),
        percent(c.confidence),
        c.source.as_str()
    );
    if let Some(linked) = &c.linked_account {
        println!("  Linked:      {linked}");
    }
    if let Some(note) = &c.note {
        println!("  Note:        {}", note.dimmed());
    }
    if let Some(existing) = staged.duplicate_of {
        println!("  {}", format!("Possible duplicate of transaction {existing}").yellow());
    }
    if let Some(error) = &staged.error {
        println!("  {}", format!("Last attempt failed: {error}").red());
    }
    println!();
}

fn prompt_movement(
    reviewer: &mut Reviewer<'_>,
    staged: &StagedMovement,
    choices: &Choices,
) -> Result<Step> {
    let items = [
        "Confirm",
        "Correct category",
        "Correct everything",
        "Ignore",
        "View similar patterns",
        "Leave for later",
        "Exit",
    ];
    loop {
        show_movement(reviewer, staged);
        let Ok(choice) = Select::new().with_prompt("Action").items(&items).default(0).interact() else {
            return Ok(Step::Exit);
        };
        let resolution = match choice {
            0 => Resolution::confirm(staged),
            1 => match correct(staged, choices, false)? {
                Some(classification) => Resolution::correct(classification),
                None => continue,
            },
            2 => match correct(staged, choices, true)? {
                Some(classification) => Resolution::correct(classification),
                None => continue,
            },
            3 => Resolution::ignore(staged),
            4 => {
                similar_patterns(reviewer, staged);
                continue;
            }
            5 => return Ok(Step::Defer),
            _ => return Ok(Step::Exit),
        };
        let resolution = match (staged.duplicate_of, reviewer.policy(), resolution.state) {
            (Some(existing), DuplicatePolicy::PerItem, ReviewState::Confirmed | ReviewState::Corrected) => {
                match ask_duplicate(existing) {
                    Some(decision) => resolution.with_duplicate(decision),
                    None => continue,
                }
            }
            _ => resolution,
        };
        return Ok(Step::Resolve(resolution));
    }
}

fn ask_duplicate(existing: i64) -> Option<DuplicateDecision> {
    let items = [
        "Skip this movement",
        "Overwrite the existing transaction",
        "Import as a new transaction",
        "Back",
    ];
    let choice = Select::new()
        .with_prompt(format!("Duplicate of transaction {existing}"))
        .items(&items)
        .default(0)
        .interact()
        .ok()?;
    match choice {
        0 => Some(DuplicateDecision::Skip),
        1 => Some(DuplicateDecision::Overwrite),
        2 => Some(DuplicateDecision::Import),
        _ => None,
    }
}

/// Draft a correction until the operator saves it. `None` goes back to the
/// action menu.
fn correct(staged: &StagedMovement, choices: &Choices, full: bool) -> Result<Option<Classification>> {
    let mut state = ReviewState::Pending;
    let mut base = staged.classification.clone();
    loop {
        let Some(draft) = draft_correction(&base, choices, full) else {
            return Ok(None);
        };
        state = transition(state, Action::Correct)?;
        println!(
            "  Draft:       {} / {}{}",
            draft.kind,
            draft.category.bold(),
            draft
                .linked_account
                .as_deref()
                .map(|a| format!(" \u{2192} {a}"))
                .unwrap_or_default()
        );
        let save = Select::new()
            .items(&["Save", "Edit again", "Cancel"])
            .default(0)
            .interact()
            .unwrap_or(2);
        match save {
            0 => return Ok(Some(draft)),
            1 => {
                state = transition(state, Action::EditAgain)?;
                base = draft;
            }
            _ => return Ok(None),
        }
    }
}

fn draft_correction(base: &Classification, choices: &Choices, full: bool) -> Option<Classification> {
    if !full {
        let category = pick_category(&choices.categories, &base.category)?;
        return Some(corrected(base, base.kind, Some(&category), base.linked_account.clone()));
    }

    let kinds = [TransactionKind::Expense, TransactionKind::Income, TransactionKind::Transfer];
    let current = kinds.iter().position(|k| *k == base.kind).unwrap_or(0);
    let labels: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
    let kind = kinds[Select::new()
        .with_prompt("Kind")
        .items(&labels)
        .default(current)
        .interact()
        .ok()?];
    let category = pick_category(&choices.categories, &base.category)?;
    let linked = pick_account(&choices.accounts, base.linked_account.as_deref(), kind)?;
    Some(corrected(base, kind, Some(&category), linked))
}

fn pick_category(categories: &[String], current: &str) -> Option<String> {
    let mut items: Vec<&str> = categories.iter().map(String::as_str).collect();
    items.push("New category...");
    let default = categories.iter().position(|c| c == current).unwrap_or(0);
    let idx = Select::new()
        .with_prompt("Category")
        .items(&items)
        .default(default)
        .interact()
        .ok()?;
    if idx < categories.len() {
        return Some(categories[idx].clone());
    }
    let name: String = Input::new().with_prompt("Category name").interact_text().ok()?;
    let name = name.trim().to_string();
    (!name.is_empty()).then_some(name)
}

/// Outer `None` is a cancel; inner `None` means no linked account.
fn pick_account(accounts: &[String], current: Option<&str>, kind: TransactionKind) -> Option<Option<String>> {
    let mut items: Vec<&str> = accounts.iter().map(String::as_str).collect();
    items.push("Other account...");
    items.push("None");
    let default = match current {
        Some(c) => accounts.iter().position(|a| a == c).unwrap_or(accounts.len()),
        None if kind == TransactionKind::Transfer => accounts.len(),
        None => accounts.len() + 1,
    };
    let idx = Select::new()
        .with_prompt("Linked account")
        .items(&items)
        .default(default)
        .interact()
        .ok()?;
    if idx < accounts.len() {
        return Some(Some(accounts[idx].clone()));
    }
    if idx == accounts.len() + 1 {
        return Some(None);
    }
    let mut input = Input::<String>::new().with_prompt("Account name").allow_empty(true);
    if let Some(c) = current {
        input = input.default(c.to_string());
    }
    let name = input.interact_text().ok()?;
    let name = name.trim();
    Some((!name.is_empty()).then(|| name.to_string()))
}

fn similar_patterns(reviewer: &mut Reviewer<'_>, staged: &StagedMovement) {
    let matches = reviewer.similar_patterns(staged);
    if matches.is_empty() {
        println!("{}", "No learned patterns match this movement.".dimmed());
        return;
    }
    let mut table = Table::new();
    table.set_header(vec!["#", "Type", "Kind", "Category", "Confidence", "Seen", "Validated"]);
    for (i, m) in matches.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(m.pattern_type),
            Cell::new(m.classification.kind),
            Cell::new(&m.classification.category),
            Cell::new(percent(m.confidence)),
            Cell::new(m.frequency),
            Cell::new(if m.human_validated { "yes" } else { "" }),
        ]);
    }
    println!("{table}");

    let mut items: Vec<String> = (1..=matches.len()).map(|i| format!("Pattern {i}")).collect();
    items.push("Back".to_string());
    let Ok(idx) = Select::new().with_prompt("Give feedback on").items(&items).default(matches.len()).interact() else {
        return;
    };
    let Some(m) = matches.get(idx) else {
        return;
    };
    let feedback = match Select::new()
        .items(&["Confirm pattern", "Reject pattern", "Back"])
        .default(2)
        .interact()
    {
        Ok(0) => Feedback::Confirmation,
        Ok(1) => Feedback::Rejection,
        _ => return,
    };
    match reviewer.pattern_feedback(m.pattern_type, &m.pattern_id, feedback) {
        Ok(()) => println!("{}", "Pattern updated.".green()),
        Err(e) => println!("{}", format!("Could not update pattern: {e}").red()),
    }
}

pub(crate) fn print_report(report: &BatchReport) {
    println!("{}", "\u{2500}".repeat(60));
    println!("  Processed: {}", report.processed.to_string().green());
    println!("  Skipped:   {}", report.skipped);
    if report.errored > 0 {
        println!("  Errors:    {}", report.errored.to_string().red());
        let mut table = Table::new();
        table.set_header(vec!["Date", "Amount", "Description", "Error"]);
        for e in &report.errors {
            table.add_row(vec![
                Cell::new(e.date),
                Cell::new(money(e.amount)),
                Cell::new(&e.description_prefix),
                Cell::new(&e.message),
            ]);
        }
        println!("{table}");
    } else {
        println!("  Errors:    0");
    }
    if report.exited_early {
        println!(
            "{}",
            "Review paused. Pending movements stay staged; run `cuadra review` to continue.".yellow()
        );
    } else if report.errored > 0 {
        println!("{}", "Failed movements stay pending; run `cuadra review` to retry.".yellow());
    } else {
        println!("{}", "Review complete!".green());
    }
}
