use std::path::{Path, PathBuf};
use std::time::Duration;

use comfy_table::Table;
use rusqlite::backup::Backup;
use rusqlite::Connection;

use crate::cli::{open_db, open_memory};
use crate::error::Result;
use crate::fmt::format_bytes;

/// Online copy of the ledger; readers and writers keep working while it runs.
fn copy_ledger(conn: &Connection, dest: &Path) -> Result<u64> {
    let mut dest_conn = Connection::open(dest)?;
    Backup::new(conn, &mut dest_conn)?.run_to_completion(100, Duration::from_millis(10), None)?;
    Ok(std::fs::metadata(dest)?.len())
}

/// Back up the ledger and the pattern memory together so a restore brings
/// back classifications that agree with the postings.
pub fn run(output: Option<String>) -> Result<()> {
    let (settings, conn) = open_db()?;
    let ledger_dest = match output {
        Some(p) => PathBuf::from(p),
        None => {
            let dir = PathBuf::from(&settings.data_dir).join("backups");
            std::fs::create_dir_all(&dir)?;
            dir.join(format!("cuadra-{}.db", chrono::Local::now().format("%Y%m%d-%H%M%S")))
        }
    };
    let ledger_size = copy_ledger(&conn, &ledger_dest)?;
    tracing::info!(path = %ledger_dest.display(), "Ledger backed up");

    let memory = open_memory(&settings);
    let memory_dest = memory.backup()?;
    let memory_size = std::fs::metadata(&memory_dest)?.len();

    let mut table = Table::new();
    table.set_header(vec!["Store", "Copy", "Size"]);
    table.add_row(vec![
        "Ledger".to_string(),
        ledger_dest.display().to_string(),
        format_bytes(ledger_size),
    ]);
    table.add_row(vec![
        format!("Pattern memory ({} patterns)", memory.stats().total_patterns),
        memory_dest.display().to_string(),
        format_bytes(memory_size),
    ]);
    println!("{table}");
    println!("Backup saved to {}", ledger_dest.display());
    Ok(())
}
