use comfy_table::{Cell, Table};

use crate::catalog::{self, AccountUpdate, NewAccount};
use crate::cli::open_db;
use crate::error::{CuadraError, Result};
use crate::models::AccountNature;

pub fn add(
    name: &str,
    account_type: &str,
    nature: Option<&str>,
    currency: Option<&str>,
    reference: Option<&str>,
    payment_medium: bool,
) -> Result<()> {
    let (settings, conn) = open_db()?;
    let nature = match nature {
        Some(n) => n.parse::<AccountNature>()?,
        None => catalog::default_nature(account_type),
    };
    let id = catalog::add_account(
        &conn,
        &NewAccount {
            name,
            account_type,
            nature,
            currency: currency.unwrap_or(&settings.default_currency),
            reference,
            is_payment_medium: payment_medium,
        },
    )?;
    println!("Added account {id}: {name} ({account_type}, {nature})");
    Ok(())
}

pub fn list(include_inactive: bool) -> Result<()> {
    let (_, conn) = open_db()?;
    let accounts = catalog::list_accounts(&conn, include_inactive)?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Name", "Type", "Nature", "Currency", "Reference", "Pays", "Active"]);
    for a in accounts {
        table.add_row(vec![
            Cell::new(a.id),
            Cell::new(a.name),
            Cell::new(a.account_type),
            Cell::new(a.nature),
            Cell::new(a.currency),
            Cell::new(a.reference.unwrap_or_default()),
            Cell::new(if a.is_payment_medium { "yes" } else { "" }),
            Cell::new(if a.is_active { "yes" } else { "no" }),
        ]);
    }
    println!("Accounts\n{table}");
    Ok(())
}

pub fn update(
    id: i64,
    name: Option<&str>,
    currency: Option<&str>,
    reference: Option<&str>,
    payment_medium: Option<bool>,
) -> Result<()> {
    let (_, conn) = open_db()?;
    let account = catalog::update_account(
        &conn,
        id,
        &AccountUpdate {
            name,
            currency,
            reference,
            is_payment_medium: payment_medium,
        },
    )?;
    println!("Updated account {id}: {}", account.name);
    Ok(())
}

pub fn deactivate(id: i64) -> Result<()> {
    let (_, conn) = open_db()?;
    let account = catalog::get_account(&conn, id)?;
    if !catalog::deactivate_account(&conn, id)? {
        return Err(CuadraError::Other(format!("Account {id} is already inactive")));
    }
    println!("Deactivated account {id}: {}", account.name);
    Ok(())
}
