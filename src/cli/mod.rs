pub mod accounts;
pub mod backup;
pub mod categories;
pub mod import;
pub mod init;
pub mod memory;
pub mod repair;
pub mod review;
pub mod rules;
pub mod status;

use clap::{Parser, Subcommand};
use rusqlite::Connection;

use crate::db::get_connection;
use crate::error::{CuadraError, Result};
use crate::memory::PatternMemory;
use crate::settings::{load_settings, Settings};

/// Settings plus an open database, or an error pointing at `cuadra init`.
pub(crate) fn open_db() -> Result<(Settings, Connection)> {
    let settings = load_settings();
    let db_path = settings.db_path();
    if !db_path.exists() {
        return Err(CuadraError::Settings(format!(
            "Database not found at {}. Run `cuadra init` to set up.",
            db_path.display()
        )));
    }
    let conn = get_connection(&db_path)?;
    Ok((settings, conn))
}

pub(crate) fn open_memory(settings: &Settings) -> PatternMemory {
    PatternMemory::open(&settings.memory_path(), settings.memory_backup_every)
}

#[derive(Parser)]
#[command(
    name = "cuadra",
    version,
    about = "Bank statement reconciliation with double-entry bookkeeping."
)]
pub struct Cli {
    /// Log debug output to stderr (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Choose a data directory and initialize the database.
    Init {
        /// Path for cuadra data (default: ~/Documents/cuadra)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Manage accounts.
    Accounts {
        #[command(subcommand)]
        command: AccountsCommands,
    },
    /// Manage categories.
    Categories {
        #[command(subcommand)]
        command: CategoriesCommands,
    },
    /// Manage categorization rules.
    Rules {
        #[command(subcommand)]
        command: RulesCommands,
    },
    /// Import a bank statement (CSV, XLSX/XLS or PDF) and review it.
    Import {
        /// Path to the statement file
        file: String,
        /// Account the statement belongs to
        #[arg(long)]
        account: String,
        /// What to do with duplicates: skip, overwrite or ask (per movement)
        #[arg(long)]
        policy: Option<String>,
        /// Rules only, flag duplicates by description similarity
        #[arg(long)]
        legacy: bool,
        /// Import even if this exact file was imported before
        #[arg(long)]
        force: bool,
        /// Do not call the AI classifier
        #[arg(long = "no-ai")]
        no_ai: bool,
        /// Stage the movements without starting the review
        #[arg(long = "no-review")]
        no_review: bool,
    },
    /// Review pending staged movements.
    Review {
        /// Only this import batch (default: every open batch)
        #[arg(long)]
        batch: Option<i64>,
        /// Duplicate policy for this session: skip, overwrite or ask
        #[arg(long)]
        policy: Option<String>,
    },
    /// Inspect the learned pattern memory.
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
    /// Check and repair ledger integrity.
    Repair {
        #[command(subcommand)]
        command: RepairCommands,
    },
    /// Back up the database.
    Backup {
        /// Output path (default: <data_dir>/backups/cuadra-YYYYMMDD-HHMMSS.db)
        #[arg(long)]
        output: Option<String>,
    },
    /// Show settings and database counts.
    Status,
}

#[derive(Subcommand)]
pub enum AccountsCommands {
    /// Add a new account.
    Add {
        /// Account name
        name: String,
        /// Account type: checking, savings, cash, credit_card, loan, external, service
        #[arg(long = "type")]
        account_type: String,
        /// deudora or acreedora (default follows the type)
        #[arg(long)]
        nature: Option<String>,
        /// Currency code (default from settings)
        #[arg(long)]
        currency: Option<String>,
        /// Account number or card reference
        #[arg(long)]
        reference: Option<String>,
        /// The account pays for things (checking, card)
        #[arg(long = "payment-medium")]
        payment_medium: bool,
    },
    /// List accounts.
    List {
        /// Include deactivated accounts
        #[arg(long)]
        all: bool,
    },
    /// Update an account's name, currency, reference or payment flag.
    Update {
        /// Account ID
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        currency: Option<String>,
        #[arg(long)]
        reference: Option<String>,
        /// true or false
        #[arg(long = "payment-medium")]
        payment_medium: Option<bool>,
    },
    /// Deactivate an account. Its transactions are kept.
    Deactivate {
        /// Account ID
        id: i64,
    },
}

#[derive(Subcommand)]
pub enum CategoriesCommands {
    /// Add a category or subcategory.
    Add {
        /// Category name
        name: String,
        /// Parent category name
        #[arg(long)]
        parent: Option<String>,
        /// personal or business
        #[arg(long, default_value = "personal")]
        scope: String,
        /// expense, income or transfer (default: the parent's kind, else expense)
        #[arg(long)]
        kind: Option<String>,
    },
    /// List active categories.
    List,
    /// Rename a category or change its scope.
    Update {
        /// Category ID
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        scope: Option<String>,
    },
    /// Deactivate a category.
    Deactivate {
        /// Category ID
        id: i64,
    },
}

#[derive(Subcommand)]
pub enum RulesCommands {
    /// Add a categorization rule.
    Add {
        /// Text or regex to match against the description
        pattern: String,
        /// Category name to assign
        #[arg(long)]
        category: String,
        /// expense, income or transfer
        #[arg(long, default_value = "expense")]
        kind: String,
        /// contains, starts_with or regex
        #[arg(long = "match-type", default_value = "contains")]
        match_type: String,
        /// Higher runs first
        #[arg(long, default_value_t = 0)]
        priority: i64,
        /// Counterparty account for transfers
        #[arg(long = "linked-account")]
        linked_account: Option<String>,
    },
    /// List active rules.
    List,
    /// Deactivate a rule.
    Delete {
        /// Rule ID
        id: i64,
    },
}

#[derive(Subcommand)]
pub enum MemoryCommands {
    /// Pattern counts and confidence.
    Stats,
    /// Patterns that would match a description.
    Show {
        /// Movement description as it appears on the statement
        description: String,
        /// Signed amount (negative for charges)
        #[arg(long, allow_hyphen_values = true)]
        amount: Option<String>,
    },
    /// Write a timestamped copy of the pattern memory.
    Backup,
}

#[derive(Subcommand)]
pub enum RepairCommands {
    /// Report orphaned and unbalanced transaction groups.
    Scan,
    /// Regenerate missing or wrong counter-legs.
    Fix {
        /// Show what would change without writing
        #[arg(long = "dry-run")]
        dry_run: bool,
    },
    /// Compare the ledger balance with a statement's closing balance.
    Balance {
        /// Account name
        account: String,
        /// Statement closing date (YYYY-MM-DD)
        #[arg(long = "as-of")]
        as_of: String,
        /// Statement closing balance
        #[arg(long, allow_hyphen_values = true)]
        balance: String,
    },
}
