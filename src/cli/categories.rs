use comfy_table::{Cell, Table};

use crate::catalog;
use crate::cli::open_db;
use crate::error::{CuadraError, Result};

pub fn add(name: &str, parent: Option<&str>, scope: &str, kind: Option<&str>) -> Result<()> {
    let (_, conn) = open_db()?;
    let parent = parent
        .map(|p| catalog::require_category(&conn, p))
        .transpose()?;
    let kind = kind
        .map(str::to_lowercase)
        .or_else(|| parent.as_ref().map(|p| p.kind.clone()))
        .unwrap_or_else(|| "expense".to_string());
    let id = catalog::add_category(&conn, name, parent.as_ref().map(|p| p.id), scope, &kind)?;
    match parent {
        Some(p) => println!("Added category {id}: {} > {name}", p.name),
        None => println!("Added category {id}: {name}"),
    }
    Ok(())
}

pub fn list() -> Result<()> {
    let (_, conn) = open_db()?;
    let categories = catalog::list_categories(&conn)?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Name", "Kind", "Scope"]);
    for cat in categories {
        let name = match (&cat.icon, cat.parent_id) {
            (_, Some(_)) => format!("  \u{2514} {}", cat.name),
            (Some(icon), None) => format!("{icon} {}", cat.name),
            (None, None) => cat.name,
        };
        table.add_row(vec![
            Cell::new(cat.id),
            Cell::new(name),
            Cell::new(cat.kind),
            Cell::new(cat.scope),
        ]);
    }
    println!("Categories\n{table}");
    Ok(())
}

pub fn update(id: i64, name: Option<&str>, scope: Option<&str>) -> Result<()> {
    if name.is_none() && scope.is_none() {
        return Err(CuadraError::Other("Nothing to update: pass --name or --scope".into()));
    }
    let (_, conn) = open_db()?;
    catalog::update_category(&conn, id, name, scope)?;
    println!("Updated category {id}");
    Ok(())
}

pub fn deactivate(id: i64) -> Result<()> {
    let (_, conn) = open_db()?;
    if !catalog::deactivate_category(&conn, id)? {
        return Err(CuadraError::Other(format!("No active category with ID {id}")));
    }
    println!("Deactivated category {id}");
    Ok(())
}
