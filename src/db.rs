use std::path::Path;
use std::str::FromStr;

use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use rust_decimal::Decimal;

use crate::error::Result;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    account_type TEXT NOT NULL,
    nature TEXT NOT NULL CHECK (nature IN ('DEUDORA', 'ACREEDORA')),
    currency TEXT NOT NULL DEFAULT 'MXN',
    reference TEXT,
    is_payment_medium INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS categories (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    parent_id INTEGER,
    scope TEXT NOT NULL DEFAULT 'personal',
    kind TEXT NOT NULL DEFAULT 'expense',
    icon TEXT,
    color TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    FOREIGN KEY (parent_id) REFERENCES categories(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_categories_sibling
    ON categories (name, COALESCE(parent_id, 0));

CREATE TABLE IF NOT EXISTS import_batches (
    id INTEGER PRIMARY KEY,
    filename TEXT NOT NULL,
    account_id INTEGER NOT NULL,
    checksum TEXT,
    movement_count INTEGER NOT NULL DEFAULT 0,
    total_debit TEXT NOT NULL DEFAULT '0',
    total_credit TEXT NOT NULL DEFAULT '0',
    first_date TEXT,
    last_date TEXT,
    processed INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    errored INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'staged',
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (account_id) REFERENCES accounts(id)
);

CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY,
    group_id TEXT NOT NULL,
    account_id INTEGER NOT NULL,
    service_account_id INTEGER,
    kind TEXT NOT NULL CHECK (kind IN ('EXPENSE', 'INCOME', 'TRANSFER')),
    amount TEXT NOT NULL,
    date TEXT NOT NULL,
    description TEXT NOT NULL,
    category_id INTEGER,
    currency TEXT NOT NULL DEFAULT 'MXN',
    is_reconciled INTEGER NOT NULL DEFAULT 0,
    bank_description TEXT,
    balance_after TEXT,
    bank_reference TEXT,
    batch_id INTEGER,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (account_id) REFERENCES accounts(id),
    FOREIGN KEY (service_account_id) REFERENCES accounts(id),
    FOREIGN KEY (category_id) REFERENCES categories(id),
    FOREIGN KEY (batch_id) REFERENCES import_batches(id)
);

CREATE INDEX IF NOT EXISTS idx_transactions_group ON transactions (group_id);
CREATE INDEX IF NOT EXISTS idx_transactions_date ON transactions (date);

CREATE TABLE IF NOT EXISTS transfers (
    id INTEGER PRIMARY KEY,
    origin_txn_id INTEGER NOT NULL,
    destination_txn_id INTEGER NOT NULL,
    CHECK (origin_txn_id <> destination_txn_id),
    FOREIGN KEY (origin_txn_id) REFERENCES transactions(id) ON DELETE CASCADE,
    FOREIGN KEY (destination_txn_id) REFERENCES transactions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS staged_movements (
    id INTEGER PRIMARY KEY,
    batch_id INTEGER NOT NULL,
    row_index INTEGER NOT NULL,
    date TEXT NOT NULL,
    description TEXT NOT NULL,
    is_debit INTEGER NOT NULL,
    amount TEXT NOT NULL,
    running_balance TEXT,
    reference TEXT,
    kind TEXT NOT NULL,
    category TEXT NOT NULL,
    linked_account TEXT,
    confidence REAL NOT NULL DEFAULT 0,
    source TEXT NOT NULL,
    pattern_type TEXT,
    pattern_id TEXT,
    note TEXT,
    pattern_suggestion TEXT,
    duplicate_of INTEGER,
    state TEXT NOT NULL DEFAULT 'pending',
    error TEXT,
    group_id TEXT,
    FOREIGN KEY (batch_id) REFERENCES import_batches(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS rules (
    id INTEGER PRIMARY KEY,
    pattern TEXT NOT NULL,
    match_type TEXT DEFAULT 'contains',
    kind TEXT NOT NULL DEFAULT 'EXPENSE',
    category_id INTEGER NOT NULL,
    linked_account TEXT,
    priority INTEGER DEFAULT 0,
    hit_count INTEGER DEFAULT 0,
    is_active INTEGER DEFAULT 1,
    created_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (category_id) REFERENCES categories(id)
);

CREATE TABLE IF NOT EXISTS reconciliations (
    id INTEGER PRIMARY KEY,
    account_id INTEGER NOT NULL,
    as_of TEXT NOT NULL,
    statement_balance TEXT NOT NULL,
    calculated_balance TEXT NOT NULL,
    is_reconciled INTEGER NOT NULL DEFAULT 0,
    reconciled_at TEXT,
    FOREIGN KEY (account_id) REFERENCES accounts(id)
);
";

// (name, scope, kind, icon, color)
const DEFAULT_CATEGORIES: &[(&str, &str, &str, &str, &str)] = &[
    // Income
    ("Salario", "personal", "income", "\u{1F4BC}", "#2e7d32"),
    ("Honorarios", "business", "income", "\u{1F9FE}", "#388e3c"),
    ("Ventas", "business", "income", "\u{1F6D2}", "#43a047"),
    ("Intereses", "personal", "income", "\u{1F4C8}", "#66bb6a"),
    ("Reembolsos", "personal", "income", "\u{21A9}", "#81c784"),
    ("Otros Ingresos", "personal", "income", "\u{2795}", "#a5d6a7"),
    // Expenses
    ("Supermercado", "personal", "expense", "\u{1F6D2}", "#ef6c00"),
    ("Restaurantes", "personal", "expense", "\u{1F37D}", "#f57c00"),
    ("Transporte", "personal", "expense", "\u{1F697}", "#fb8c00"),
    ("Gasolina", "personal", "expense", "\u{26FD}", "#ffa726"),
    ("Servicios", "personal", "expense", "\u{1F4A1}", "#1565c0"),
    ("Telefonía e Internet", "personal", "expense", "\u{1F4F6}", "#1976d2"),
    ("Suscripciones", "personal", "expense", "\u{1F4FA}", "#1e88e5"),
    ("Salud", "personal", "expense", "\u{1FA7A}", "#c62828"),
    ("Educación", "personal", "expense", "\u{1F393}", "#6a1b9a"),
    ("Vivienda", "personal", "expense", "\u{1F3E0}", "#4e342e"),
    ("Seguros", "personal", "expense", "\u{1F6E1}", "#5d4037"),
    ("Impuestos", "business", "expense", "\u{1F3DB}", "#37474f"),
    ("Comisiones Bancarias", "personal", "expense", "\u{1F3E6}", "#455a64"),
    ("Compras", "personal", "expense", "\u{1F6CD}", "#ad1457"),
    ("Entretenimiento", "personal", "expense", "\u{1F3AC}", "#d81b60"),
    ("Efectivo", "personal", "expense", "\u{1F4B5}", "#00695c"),
    // Transfers
    ("Transferencias", "personal", "transfer", "\u{1F501}", "#546e7a"),
    ("Pago de Tarjeta", "personal", "transfer", "\u{1F4B3}", "#607d8b"),
    ("Sin categoría", "personal", "expense", "\u{2753}", "#9e9e9e"),
];

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let count: i64 = conn.query_row("SELECT count(*) FROM categories", [], |row| row.get(0))?;
    if count == 0 {
        for cat in DEFAULT_CATEGORIES {
            conn.execute(
                "INSERT INTO categories (name, scope, kind, icon, color) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![cat.0, cat.1, cat.2, cat.3, cat.4],
            )?;
        }
    }
    Ok(())
}

/// Money is stored as canonical decimal text so it round-trips exactly.
pub fn decimal_to_sql(value: Decimal) -> String {
    value.normalize().to_string()
}

pub fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn optional_decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        Decimal::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

#[cfg(test)]
pub(crate) fn test_db() -> (tempfile::TempDir, Connection) {
    let dir = tempfile::tempdir().unwrap();
    let conn = get_connection(&dir.path().join("test.db")).unwrap();
    init_db(&conn).unwrap();
    (dir, conn)
}
