mod ai;
mod catalog;
mod categorizer;
mod cli;
mod db;
mod dedupe;
mod engine;
mod error;
mod fmt;
mod importer;
mod ledger;
mod memory;
mod models;
mod reconciler;
mod retry;
mod reviewer;
mod settings;
mod statement;

use clap::Parser;
use tracing_subscriber::{prelude::*, EnvFilter};

use cli::import::ImportArgs;
use cli::{
    AccountsCommands, CategoriesCommands, Cli, Commands, MemoryCommands, RepairCommands,
    RulesCommands,
};

fn main() {
    let cli = Cli::parse();

    // RUST_LOG > --verbose > warn. Logs go to stderr; stdout is for the operator.
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();

    let result = match cli.command {
        Commands::Init { data_dir } => cli::init::run(data_dir),
        Commands::Accounts { command } => match command {
            AccountsCommands::Add {
                name,
                account_type,
                nature,
                currency,
                reference,
                payment_medium,
            } => cli::accounts::add(
                &name,
                &account_type,
                nature.as_deref(),
                currency.as_deref(),
                reference.as_deref(),
                payment_medium,
            ),
            AccountsCommands::List { all } => cli::accounts::list(all),
            AccountsCommands::Update {
                id,
                name,
                currency,
                reference,
                payment_medium,
            } => cli::accounts::update(
                id,
                name.as_deref(),
                currency.as_deref(),
                reference.as_deref(),
                payment_medium,
            ),
            AccountsCommands::Deactivate { id } => cli::accounts::deactivate(id),
        },
        Commands::Categories { command } => match command {
            CategoriesCommands::Add {
                name,
                parent,
                scope,
                kind,
            } => cli::categories::add(&name, parent.as_deref(), &scope, kind.as_deref()),
            CategoriesCommands::List => cli::categories::list(),
            CategoriesCommands::Update { id, name, scope } => {
                cli::categories::update(id, name.as_deref(), scope.as_deref())
            }
            CategoriesCommands::Deactivate { id } => cli::categories::deactivate(id),
        },
        Commands::Rules { command } => match command {
            RulesCommands::Add {
                pattern,
                category,
                kind,
                match_type,
                priority,
                linked_account,
            } => cli::rules::add(
                &pattern,
                &category,
                &kind,
                &match_type,
                priority,
                linked_account.as_deref(),
            ),
            RulesCommands::List => cli::rules::list(),
            RulesCommands::Delete { id } => cli::rules::delete(id),
        },
        Commands::Import {
            file,
            account,
            policy,
            legacy,
            force,
            no_ai,
            no_review,
        } => cli::import::run(&ImportArgs {
            file: &file,
            account: &account,
            policy: policy.as_deref(),
            legacy,
            force,
            no_ai,
            no_review,
        }),
        Commands::Review { batch, policy } => cli::review::run(batch, policy),
        Commands::Memory { command } => match command {
            MemoryCommands::Stats => cli::memory::stats(),
            MemoryCommands::Show {
                description,
                amount,
            } => cli::memory::show(&description, amount.as_deref()),
            MemoryCommands::Backup => cli::memory::backup(),
        },
        Commands::Repair { command } => match command {
            RepairCommands::Scan => cli::repair::scan(),
            RepairCommands::Fix { dry_run } => cli::repair::fix(dry_run),
            RepairCommands::Balance {
                account,
                as_of,
                balance,
            } => cli::repair::balance(&account, &as_of, &balance),
        },
        Commands::Backup { output } => cli::backup::run(output),
        Commands::Status => cli::status::run(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
