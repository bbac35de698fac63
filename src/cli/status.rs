use crate::cli::open_memory;
use crate::db::get_connection;
use crate::error::Result;
use crate::fmt::format_bytes;
use crate::settings::load_settings;

pub fn run() -> Result<()> {
    let settings = load_settings();
    let db_path = settings.db_path();

    println!("User:       {}", if settings.user_name.is_empty() { "(not set)" } else { &settings.user_name });
    println!("Data dir:   {}", settings.data_dir);
    println!("Database:   {}", db_path.display());
    println!(
        "AI:         {}",
        settings.ai.resolved_endpoint().unwrap_or_else(|| "(disabled)".to_string())
    );

    if db_path.exists() {
        let size = std::fs::metadata(&db_path)?.len();
        println!("DB size:    {}", format_bytes(size));

        let conn = get_connection(&db_path)?;
        let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };

        let accounts = count("SELECT count(*) FROM accounts WHERE is_active = 1")?;
        let transactions = count("SELECT count(*) FROM transactions")?;
        let pending = count("SELECT count(*) FROM staged_movements WHERE state = 'pending'")?;
        let batches = count("SELECT count(*) FROM import_batches")?;
        let rules = count("SELECT count(*) FROM rules WHERE is_active = 1")?;
        let patterns = open_memory(&settings).stats().total_patterns;

        println!();
        println!("Accounts:      {accounts}");
        println!("Transactions:  {transactions}");
        println!("Imports:       {batches}");
        println!("Pending:       {pending}");
        println!("Rules:         {rules}");
        println!("Patterns:      {patterns}");
    } else {
        println!();
        println!("Database not found. Run `cuadra init` to set up.");
    }

    Ok(())
}
