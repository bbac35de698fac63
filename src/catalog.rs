//! Accounts and categories: the data layer behind the CRUD commands plus the
//! lookup-or-create helpers the review loop uses.

use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::{CuadraError, Result};
use crate::models::{Account, AccountNature, Category, TransactionKind};

const ACCOUNT_COLUMNS: &str =
    "id, name, account_type, nature, currency, reference, is_payment_medium, is_active";
const CATEGORY_COLUMNS: &str = "id, name, parent_id, scope, kind, icon, color, is_active";

pub const ACCOUNT_TYPES: &[&str] = &[
    "checking",
    "savings",
    "cash",
    "credit_card",
    "loan",
    "external",
    "service",
];

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let nature: String = row.get(3)?;
    Ok(Account {
        id: row.get(0)?,
        name: row.get(1)?,
        account_type: row.get(2)?,
        nature: if nature == "ACREEDORA" {
            AccountNature::Creditor
        } else {
            AccountNature::Debtor
        },
        currency: row.get(4)?,
        reference: row.get(5)?,
        is_payment_medium: row.get::<_, i64>(6)? != 0,
        is_active: row.get::<_, i64>(7)? != 0,
    })
}

fn category_from_row(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
        parent_id: row.get(2)?,
        scope: row.get(3)?,
        kind: row.get(4)?,
        icon: row.get(5)?,
        color: row.get(6)?,
        is_active: row.get::<_, i64>(7)? != 0,
    })
}

/// Nature implied by an account type: liabilities are creditor-natured.
pub fn default_nature(account_type: &str) -> AccountNature {
    match account_type {
        "credit_card" | "loan" => AccountNature::Creditor,
        _ => AccountNature::Debtor,
    }
}

#[derive(Debug, Clone)]
pub struct NewAccount<'a> {
    pub name: &'a str,
    pub account_type: &'a str,
    pub nature: AccountNature,
    pub currency: &'a str,
    pub reference: Option<&'a str>,
    pub is_payment_medium: bool,
}

pub fn add_account(conn: &Connection, new: &NewAccount<'_>) -> Result<i64> {
    let name = new.name.trim();
    if name.is_empty() {
        return Err(CuadraError::Other("Account name cannot be empty".into()));
    }
    if !ACCOUNT_TYPES.contains(&new.account_type) {
        return Err(CuadraError::Other(format!(
            "Invalid account type: {} (expected one of {})",
            new.account_type,
            ACCOUNT_TYPES.join(", ")
        )));
    }
    if get_account_by_name(conn, name)?.is_some() {
        return Err(CuadraError::Other(format!("Account '{name}' already exists")));
    }
    conn.execute(
        "INSERT INTO accounts (name, account_type, nature, currency, reference, is_payment_medium) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            name,
            new.account_type,
            new.nature.as_str(),
            new.currency,
            new.reference,
            new.is_payment_medium as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_accounts(conn: &Connection, include_inactive: bool) -> Result<Vec<Account>> {
    let sql = if include_inactive {
        format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY name")
    } else {
        format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE is_active = 1 ORDER BY name")
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], account_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_account(conn: &Connection, id: i64) -> Result<Account> {
    conn.query_row(
        &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
        [id],
        account_from_row,
    )
    .optional()?
    .ok_or_else(|| CuadraError::UnknownAccount(format!("#{id}")))
}

pub fn get_account_by_name(conn: &Connection, name: &str) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE name = ?1 COLLATE NOCASE"),
            [name.trim()],
            account_from_row,
        )
        .optional()?;
    Ok(account)
}

pub fn require_account(conn: &Connection, name: &str) -> Result<Account> {
    get_account_by_name(conn, name)?.ok_or_else(|| CuadraError::UnknownAccount(name.to_string()))
}

pub fn deactivate_account(conn: &Connection, id: i64) -> Result<bool> {
    let n = conn.execute(
        "UPDATE accounts SET is_active = 0 WHERE id = ?1 AND is_active = 1",
        [id],
    )?;
    Ok(n > 0)
}

/// Changes to an existing account. Nature and type are fixed at creation.
#[derive(Debug, Clone, Default)]
pub struct AccountUpdate<'a> {
    pub name: Option<&'a str>,
    pub currency: Option<&'a str>,
    pub reference: Option<&'a str>,
    pub is_payment_medium: Option<bool>,
}

pub fn update_account(conn: &Connection, id: i64, update: &AccountUpdate<'_>) -> Result<Account> {
    let current = get_account(conn, id)?;
    let name = match update.name.map(str::trim) {
        Some("") => return Err(CuadraError::Other("Account name cannot be empty".into())),
        Some(name) => {
            if let Some(other) = get_account_by_name(conn, name)? {
                if other.id != id {
                    return Err(CuadraError::Other(format!("Account '{name}' already exists")));
                }
            }
            name.to_string()
        }
        None => current.name,
    };
    conn.execute(
        "UPDATE accounts SET name = ?1, currency = ?2, reference = ?3, is_payment_medium = ?4 WHERE id = ?5",
        rusqlite::params![
            name,
            update.currency.unwrap_or(&current.currency),
            update.reference.or(current.reference.as_deref()),
            update.is_payment_medium.unwrap_or(current.is_payment_medium) as i64,
            id,
        ],
    )?;
    get_account(conn, id)
}

pub fn account_names(conn: &Connection) -> Result<Vec<String>> {
    Ok(list_accounts(conn, false)?.into_iter().map(|a| a.name).collect())
}

/// Find the named account, creating an external debtor account when it does
/// not exist yet. Inactive or unnamed counterparties cannot take a leg.
pub fn resolve_or_create_account(conn: &Connection, name: &str, currency: &str) -> Result<Account> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CuadraError::LedgerIntegrity("counterparty account has no name".into()));
    }
    if let Some(account) = get_account_by_name(conn, name)? {
        if !account.is_active {
            return Err(CuadraError::LedgerIntegrity(format!(
                "counterparty account '{}' is inactive",
                account.name
            )));
        }
        return Ok(account);
    }
    let id = add_account(
        conn,
        &NewAccount {
            name,
            account_type: "external",
            nature: AccountNature::Debtor,
            currency,
            reference: None,
            is_payment_medium: false,
        },
    )?;
    tracing::info!(account = name, "Created counterparty account");
    get_account(conn, id)
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

pub fn category_kind(kind: TransactionKind) -> &'static str {
    match kind {
        TransactionKind::Expense => "expense",
        TransactionKind::Income => "income",
        TransactionKind::Transfer => "transfer",
    }
}

pub fn add_category(
    conn: &Connection,
    name: &str,
    parent_id: Option<i64>,
    scope: &str,
    kind: &str,
) -> Result<i64> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CuadraError::Other("Category name cannot be empty".into()));
    }
    if !matches!(scope, "personal" | "business") {
        return Err(CuadraError::Other(format!(
            "Invalid scope: {scope} (must be 'personal' or 'business')"
        )));
    }
    if !matches!(kind, "income" | "expense" | "transfer") {
        return Err(CuadraError::Other(format!(
            "Invalid category kind: {kind} (must be 'income', 'expense' or 'transfer')"
        )));
    }
    conn.execute(
        "INSERT INTO categories (name, parent_id, scope, kind) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![name, parent_id, scope, kind],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation => {
            CuadraError::Other(format!("Category '{name}' already exists at this level"))
        }
        other => other.into(),
    })?;
    Ok(conn.last_insert_rowid())
}

pub fn update_category(conn: &Connection, id: i64, name: Option<&str>, scope: Option<&str>) -> Result<()> {
    if let Some(scope) = scope {
        if !matches!(scope, "personal" | "business") {
            return Err(CuadraError::Other(format!(
                "Invalid scope: {scope} (must be 'personal' or 'business')"
            )));
        }
    }
    if name.is_some_and(|n| n.trim().is_empty()) {
        return Err(CuadraError::Other("Category name cannot be empty".into()));
    }
    let n = conn
        .execute(
            "UPDATE categories SET name = COALESCE(?1, name), scope = COALESCE(?2, scope) WHERE id = ?3",
            rusqlite::params![name.map(str::trim), scope, id],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation => {
                CuadraError::Other("A category with that name already exists at this level".into())
            }
            other => other.into(),
        })?;
    if n == 0 {
        return Err(CuadraError::UnknownCategory(format!("#{id}")));
    }
    Ok(())
}

/// Soft-delete. Posted transactions keep pointing at the row.
pub fn deactivate_category(conn: &Connection, id: i64) -> Result<bool> {
    let n = conn.execute(
        "UPDATE categories SET is_active = 0 WHERE id = ?1 AND is_active = 1",
        [id],
    )?;
    Ok(n > 0)
}

pub fn list_categories(conn: &Connection) -> Result<Vec<Category>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CATEGORY_COLUMNS} FROM categories WHERE is_active = 1 \
         ORDER BY kind, COALESCE(parent_id, id), parent_id IS NOT NULL, name"
    ))?;
    let rows = stmt
        .query_map([], category_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Top-level categories win over same-named subcategories.
pub fn get_category_by_name(conn: &Connection, name: &str) -> Result<Option<Category>> {
    let category = conn
        .query_row(
            &format!(
                "SELECT {CATEGORY_COLUMNS} FROM categories \
                 WHERE name = ?1 COLLATE NOCASE AND is_active = 1 \
                 ORDER BY parent_id IS NOT NULL, id LIMIT 1"
            ),
            [name.trim()],
            category_from_row,
        )
        .optional()?;
    Ok(category)
}

pub fn require_category(conn: &Connection, name: &str) -> Result<Category> {
    get_category_by_name(conn, name)?.ok_or_else(|| CuadraError::UnknownCategory(name.to_string()))
}

pub fn resolve_or_create_category(conn: &Connection, name: &str, kind: TransactionKind) -> Result<Category> {
    if let Some(category) = get_category_by_name(conn, name)? {
        return Ok(category);
    }
    let id = add_category(conn, name, None, "personal", category_kind(kind))?;
    tracing::info!(category = name.trim(), "Created category");
    let category = conn.query_row(
        &format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = ?1"),
        [id],
        category_from_row,
    )?;
    Ok(category)
}
