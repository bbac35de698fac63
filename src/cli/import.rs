use std::path::Path;

use colored::Colorize;
use rusqlite::Connection;

use crate::ai::{AiClassifier, HttpBackend};
use crate::catalog;
use crate::cli::review::{ask_policy, review_batch};
use crate::cli::{open_db, open_memory};
use crate::dedupe::DuplicatePolicy;
use crate::engine::Engine;
use crate::error::{CuadraError, Result};
use crate::importer::{stage_file, StageOptions};
use crate::retry::RetryPolicy;
use crate::settings::Settings;

pub struct ImportArgs<'a> {
    pub file: &'a str,
    pub account: &'a str,
    pub policy: Option<&'a str>,
    pub legacy: bool,
    pub force: bool,
    pub no_ai: bool,
    pub no_review: bool,
}

fn build_classifier(settings: &Settings, conn: &Connection) -> Result<Option<AiClassifier>> {
    let Some(backend) = HttpBackend::from_settings(&settings.ai)? else {
        return Ok(None);
    };
    let classifier = AiClassifier::new(Box::new(backend), RetryPolicy::from_settings(&settings.ai))
        .with_known_accounts(catalog::account_names(conn)?);
    Ok(Some(classifier))
}

pub fn run(args: &ImportArgs<'_>) -> Result<()> {
    let path = Path::new(args.file);
    if !path.exists() {
        return Err(CuadraError::Other(format!("File not found: {}", args.file)));
    }
    let policy: Option<DuplicatePolicy> = args.policy.map(str::parse::<DuplicatePolicy>).transpose()?;
    let (settings, conn) = open_db()?;
    let mut memory = open_memory(&settings);

    let classifier = if args.no_ai || args.legacy {
        None
    } else {
        build_classifier(&settings, &conn)?
    };
    if classifier.is_none() && !args.no_ai && !args.legacy {
        println!("{}", "AI classifier not configured; using rules and learned patterns.".dimmed());
    }

    let result = {
        let engine = Engine::new(&conn, &memory, classifier.as_ref(), settings.thresholds.clone());
        stage_file(
            &conn,
            &engine,
            path,
            args.account,
            StageOptions {
                force: args.force,
                legacy: args.legacy,
            },
        )?
    };

    if let Some(previous) = result.duplicate_file {
        println!(
            "{}",
            format!("This file was already imported (batch {previous}). Use --force to import it again.")
                .yellow()
        );
        return Ok(());
    }
    for warning in &result.warnings {
        println!("{}", format!("  warning: {warning}").yellow());
    }
    let Some(batch_id) = result.batch_id else {
        println!("No movements found in {}", args.file);
        return Ok(());
    };

    println!(
        "Staged {} movements from {} into batch {batch_id}",
        result.staged,
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    );
    if result.duplicates > 0 {
        println!("  {}", format!("Possible duplicates: {}", result.duplicates).yellow());
    }
    if result.dropped > 0 {
        println!("  Unreadable rows skipped: {}", result.dropped);
    }

    if args.no_review {
        println!("Run `cuadra review --batch {batch_id}` to review.");
        return Ok(());
    }

    let policy = match policy {
        Some(p) => p,
        None if args.legacy || result.duplicates == 0 => DuplicatePolicy::SkipAll,
        None => ask_policy(),
    };
    review_batch(&conn, &mut memory, &settings, batch_id, policy)?;
    Ok(())
}
