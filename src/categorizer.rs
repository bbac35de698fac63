use regex::Regex;
use rusqlite::Connection;

use crate::error::Result;
use crate::models::{Classification, ClassificationSource, RawMovement, TransactionKind};

pub const UNCATEGORIZED: &str = "Sin categoría";

const USER_RULE_CONFIDENCE: f64 = 0.85;
const KEYWORD_CONFIDENCE: f64 = 0.5;
const MERCHANT_CONFIDENCE: f64 = 0.45;
const DEFAULT_CONFIDENCE: f64 = 0.2;

/// Provisional classification from the built-in tables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuiltinMatch {
    pub kind: TransactionKind,
    pub category: &'static str,
    pub icon: Option<&'static str>,
    pub color: Option<&'static str>,
    pub confidence: f64,
}

// (trigger, kind, category, icon, color). Earlier entries win.
const KEYWORD_RULES: &[(&str, TransactionKind, &str, &str, &str)] = &[
    ("SPEI ENVIADO", TransactionKind::Transfer, "Transferencias", "\u{1F501}", "#546e7a"),
    ("TRANSFERENCIA ENVIADA", TransactionKind::Transfer, "Transferencias", "\u{1F501}", "#546e7a"),
    ("TRASPASO", TransactionKind::Transfer, "Transferencias", "\u{1F501}", "#546e7a"),
    ("PAGO TARJETA", TransactionKind::Transfer, "Pago de Tarjeta", "\u{1F4B3}", "#607d8b"),
    ("PAGO TDC", TransactionKind::Transfer, "Pago de Tarjeta", "\u{1F4B3}", "#607d8b"),
    ("NOMINA", TransactionKind::Income, "Salario", "\u{1F4BC}", "#2e7d32"),
    ("NÓMINA", TransactionKind::Income, "Salario", "\u{1F4BC}", "#2e7d32"),
    ("HONORARIOS", TransactionKind::Income, "Honorarios", "\u{1F9FE}", "#388e3c"),
    ("INTERESES", TransactionKind::Income, "Intereses", "\u{1F4C8}", "#66bb6a"),
    ("RENDIMIENTO", TransactionKind::Income, "Intereses", "\u{1F4C8}", "#66bb6a"),
    ("DEVOLUCION", TransactionKind::Income, "Reembolsos", "\u{21A9}", "#81c784"),
    ("REEMBOLSO", TransactionKind::Income, "Reembolsos", "\u{21A9}", "#81c784"),
    ("SPEI RECIBIDO", TransactionKind::Income, "Otros Ingresos", "\u{2795}", "#a5d6a7"),
    ("DEPOSITO", TransactionKind::Income, "Otros Ingresos", "\u{2795}", "#a5d6a7"),
    ("COMISION", TransactionKind::Expense, "Comisiones Bancarias", "\u{1F3E6}", "#455a64"),
    ("IVA COM", TransactionKind::Expense, "Comisiones Bancarias", "\u{1F3E6}", "#455a64"),
    ("ANUALIDAD", TransactionKind::Expense, "Comisiones Bancarias", "\u{1F3E6}", "#455a64"),
    ("RETENCION ISR", TransactionKind::Expense, "Impuestos", "\u{1F3DB}", "#37474f"),
    ("PAGO SAT", TransactionKind::Expense, "Impuestos", "\u{1F3DB}", "#37474f"),
    ("RETIRO CAJERO", TransactionKind::Expense, "Efectivo", "\u{1F4B5}", "#00695c"),
    ("RETIRO EFECTIVO", TransactionKind::Expense, "Efectivo", "\u{1F4B5}", "#00695c"),
    ("COLEGIATURA", TransactionKind::Expense, "Educación", "\u{1F393}", "#6a1b9a"),
    ("RENTA", TransactionKind::Expense, "Vivienda", "\u{1F3E0}", "#4e342e"),
];

// (merchant, category). Multi-word names precede their prefixes.
const MERCHANTS: &[(&str, &str)] = &[
    ("UBER EATS", "Restaurantes"),
    ("DIDI FOOD", "Restaurantes"),
    ("RAPPI", "Restaurantes"),
    ("STARBUCKS", "Restaurantes"),
    ("VIPS", "Restaurantes"),
    ("OXXO", "Supermercado"),
    ("WALMART", "Supermercado"),
    ("BODEGA AURRERA", "Supermercado"),
    ("SORIANA", "Supermercado"),
    ("CHEDRAUI", "Supermercado"),
    ("COSTCO", "Supermercado"),
    ("LA COMER", "Supermercado"),
    ("HEB", "Supermercado"),
    ("UBER", "Transporte"),
    ("DIDI", "Transporte"),
    ("CABIFY", "Transporte"),
    ("PEMEX", "Gasolina"),
    ("GASOLINERA", "Gasolina"),
    ("NETFLIX", "Suscripciones"),
    ("SPOTIFY", "Suscripciones"),
    ("DISNEY", "Suscripciones"),
    ("AMAZON PRIME", "Suscripciones"),
    ("YOUTUBE", "Suscripciones"),
    ("CFE", "Servicios"),
    ("SACMEX", "Servicios"),
    ("NATURGY", "Servicios"),
    ("TELMEX", "Telefonía e Internet"),
    ("TELCEL", "Telefonía e Internet"),
    ("IZZI", "Telefonía e Internet"),
    ("TOTALPLAY", "Telefonía e Internet"),
    ("MEGACABLE", "Telefonía e Internet"),
    ("AMAZON", "Compras"),
    ("MERCADO LIBRE", "Compras"),
    ("MERCADOLIBRE", "Compras"),
    ("LIVERPOOL", "Compras"),
    ("FARMACIA", "Salud"),
    ("HOSPITAL", "Salud"),
    ("CINEPOLIS", "Entretenimiento"),
    ("CINEMEX", "Entretenimiento"),
    ("SEGUROS", "Seguros"),
];

// (description token, display name) for counterparty banks.
const BANKS: &[(&str, &str)] = &[
    ("BANORTE", "Banorte"),
    ("BBVA", "BBVA"),
    ("BANCOMER", "BBVA"),
    ("SANTANDER", "Santander"),
    ("BANAMEX", "Banamex"),
    ("HSBC", "HSBC"),
    ("SCOTIABANK", "Scotiabank"),
    ("INBURSA", "Inbursa"),
    ("BANCO AZTECA", "Banco Azteca"),
    ("BANCOPPEL", "BanCoppel"),
    ("BANREGIO", "Banregio"),
    ("AFIRME", "Afirme"),
    ("HEY BANCO", "Hey Banco"),
    ("MERCADO PAGO", "Mercado Pago"),
];

/// Evaluate the built-in keyword table, then the merchant table, then the
/// uncategorized default.
pub fn classify_description(description: &str) -> BuiltinMatch {
    let upper = description.to_uppercase();

    if let Some((_, kind, category, icon, color)) =
        KEYWORD_RULES.iter().find(|(trigger, ..)| upper.contains(trigger))
    {
        return BuiltinMatch {
            kind: *kind,
            category: *category,
            icon: Some(*icon),
            color: Some(*color),
            confidence: KEYWORD_CONFIDENCE,
        };
    }

    if let Some((_, category)) = MERCHANTS.iter().find(|(name, _)| upper.contains(name)) {
        return BuiltinMatch {
            kind: TransactionKind::Expense,
            category: *category,
            icon: None,
            color: None,
            confidence: MERCHANT_CONFIDENCE,
        };
    }

    BuiltinMatch {
        kind: TransactionKind::Expense,
        category: UNCATEGORIZED,
        icon: None,
        color: None,
        confidence: DEFAULT_CONFIDENCE,
    }
}

/// Name of the external account a transfer description points at, e.g.
/// "SPEI ENVIADO BANORTE" -> "Banorte - Cuenta Externa".
pub fn counterparty_account(description: &str) -> Option<String> {
    let upper = description.to_uppercase();
    BANKS
        .iter()
        .find(|(token, _)| upper.contains(token))
        .map(|(_, name)| format!("{name} - Cuenta Externa"))
}

fn matches(description: &str, pattern: &str, match_type: &str) -> bool {
    let desc_upper = description.to_uppercase();
    let pat_upper = pattern.to_uppercase();
    match match_type {
        "contains" => desc_upper.contains(&pat_upper),
        "starts_with" => desc_upper.starts_with(&pat_upper),
        "regex" => Regex::new(pattern)
            .map(|re| re.is_match(description))
            .unwrap_or(false),
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: i64,
    pub pattern: String,
    pub match_type: String,
    pub kind: TransactionKind,
    pub category: String,
    pub linked_account: Option<String>,
    pub priority: i64,
    pub hit_count: i64,
}

pub fn active_rules(conn: &Connection) -> Result<Vec<Rule>> {
    let mut stmt = conn.prepare(
        "SELECT r.id, r.pattern, r.match_type, r.kind, c.name, r.linked_account, r.priority, r.hit_count \
         FROM rules r JOIN categories c ON r.category_id = c.id \
         WHERE r.is_active = 1 ORDER BY r.priority DESC, r.id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let kind: String = row.get(3)?;
            Ok(Rule {
                id: row.get(0)?,
                pattern: row.get(1)?,
                match_type: row.get(2)?,
                kind: kind.parse().unwrap_or(TransactionKind::Expense),
                category: row.get(4)?,
                linked_account: row.get(5)?,
                priority: row.get(6)?,
                hit_count: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn add_rule(
    conn: &Connection,
    pattern: &str,
    match_type: &str,
    kind: TransactionKind,
    category_id: i64,
    linked_account: Option<&str>,
    priority: i64,
) -> Result<i64> {
    if match_type == "regex" {
        Regex::new(pattern)
            .map_err(|e| crate::error::CuadraError::Other(format!("Invalid regex '{pattern}': {e}")))?;
    }
    conn.execute(
        "INSERT INTO rules (pattern, match_type, kind, category_id, linked_account, priority) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![pattern, match_type, kind.as_str(), category_id, linked_account, priority],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Soft-delete. Returns false when the rule was missing or already inactive.
pub fn deactivate_rule(conn: &Connection, id: i64) -> Result<bool> {
    let n = conn.execute(
        "UPDATE rules SET is_active = 0 WHERE id = ?1 AND is_active = 1",
        [id],
    )?;
    Ok(n > 0)
}

/// First user rule matching the description, highest priority first. Bumps
/// the rule's hit count.
pub fn match_user_rule(conn: &Connection, description: &str) -> Result<Option<Rule>> {
    for rule in active_rules(conn)? {
        if matches(description, &rule.pattern, &rule.match_type) {
            conn.execute(
                "UPDATE rules SET hit_count = hit_count + 1 WHERE id = ?1",
                [rule.id],
            )?;
            return Ok(Some(rule));
        }
    }
    Ok(None)
}

/// Rule-based classification of one movement: user rules, then the built-in
/// tables. The kind is kept consistent with the movement's cash flow.
pub fn classify(conn: &Connection, movement: &RawMovement) -> Result<Classification> {
    let flow = movement.signed_amount();

    let mut classification = match match_user_rule(conn, &movement.description)? {
        Some(rule) => Classification {
            kind: rule.kind,
            category: rule.category,
            linked_account: rule.linked_account,
            confidence: USER_RULE_CONFIDENCE,
            source: ClassificationSource::Rule,
            note: Some(format!("rule #{}: {}", rule.id, rule.pattern)),
        },
        None => {
            let hit = classify_description(&movement.description);
            Classification {
                kind: hit.kind,
                category: hit.category.to_string(),
                linked_account: None,
                confidence: hit.confidence,
                source: ClassificationSource::Rule,
                note: None,
            }
        }
    };

    if !classification.kind.accepts_amount(flow) {
        // A charge from a merchant that pays back is a refund, anything else
        // loses its category.
        if classification.kind == TransactionKind::Expense {
            classification.category = "Reembolsos".to_string();
        } else {
            classification.category = UNCATEGORIZED.to_string();
        }
        classification.kind = TransactionKind::from_cash_flow(flow);
        classification.confidence = DEFAULT_CONFIDENCE;
    }
    if classification.kind == TransactionKind::Transfer && classification.linked_account.is_none() {
        classification.linked_account = counterparty_account(&movement.description);
    }

    tracing::debug!(
        description = %movement.description,
        kind = %classification.kind,
        category = %classification.category,
        "Rule classification"
    );
    Ok(classification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn movement(description: &str, is_debit: bool, amount: i64) -> RawMovement {
        RawMovement {
            date: NaiveDate::from_ymd_opt(2025, 1, 5).unwrap(),
            description: description.to_string(),
            is_debit,
            amount: Decimal::new(amount, 0),
            running_balance: None,
            reference: None,
        }
    }

    fn add_test_rule(conn: &Connection, pattern: &str, match_type: &str, category: &str, priority: i64) {
        let cat_id: i64 = conn
            .query_row("SELECT id FROM categories WHERE name = ?1", [category], |r| r.get(0))
            .unwrap();
        add_rule(conn, pattern, match_type, TransactionKind::Expense, cat_id, None, priority).unwrap();
    }

    #[test]
    fn test_keyword_table_first_match_wins() {
        let hit = classify_description("spei enviado banorte ref 123");
        assert_eq!(hit.kind, TransactionKind::Transfer);
        assert_eq!(hit.category, "Transferencias");
        assert!(hit.icon.is_some());
    }

    #[test]
    fn test_keyword_table_precedes_merchants() {
        // "COMISION" is in the keyword table, "OXXO" only in merchants.
        let hit = classify_description("COMISION OXXO");
        assert_eq!(hit.category, "Comisiones Bancarias");
    }

    #[test]
    fn test_merchant_order_is_respected() {
        assert_eq!(classify_description("UBER EATS MX").category, "Restaurantes");
        assert_eq!(classify_description("UBER TRIP").category, "Transporte");
        assert_eq!(classify_description("Netflix.com").category, "Suscripciones");
    }

    #[test]
    fn test_default_is_uncategorized() {
        let hit = classify_description("XYZ 123");
        assert_eq!(hit.category, UNCATEGORIZED);
        assert_eq!(hit.kind, TransactionKind::Expense);
        assert!(hit.confidence < KEYWORD_CONFIDENCE);
    }

    #[test]
    fn test_counterparty_account() {
        assert_eq!(
            counterparty_account("SPEI ENVIADO BANORTE"),
            Some("Banorte - Cuenta Externa".to_string())
        );
        assert_eq!(counterparty_account("OXXO"), None);
    }

    #[test]
    fn test_user_rule_precedes_builtin() {
        let (_dir, conn) = test_db();
        add_test_rule(&conn, "OXXO", "contains", "Restaurantes", 0);
        let c = classify(&conn, &movement("OXXO CENTRO", true, 45)).unwrap();
        assert_eq!(c.category, "Restaurantes");
        assert_eq!(c.confidence, USER_RULE_CONFIDENCE);
    }

    #[test]
    fn test_starts_with_and_regex_rules() {
        let (_dir, conn) = test_db();
        add_test_rule(&conn, "PAGO", "starts_with", "Servicios", 0);
        add_test_rule(&conn, r"^AWS.*\d+$", "regex", "Suscripciones", 0);
        assert!(match_user_rule(&conn, "PAGO LUZ").unwrap().is_some());
        assert!(match_user_rule(&conn, "MI PAGO").unwrap().is_none());
        let aws = match_user_rule(&conn, "AWS Services 12345").unwrap().unwrap();
        assert_eq!(aws.category, "Suscripciones");
    }

    #[test]
    fn test_higher_priority_wins() {
        let (_dir, conn) = test_db();
        add_test_rule(&conn, "PAGO", "contains", "Servicios", 5);
        add_test_rule(&conn, "PAGO", "contains", "Vivienda", 10);
        let rule = match_user_rule(&conn, "PAGO RENTA").unwrap().unwrap();
        assert_eq!(rule.category, "Vivienda");
    }

    #[test]
    fn test_hit_count_incremented() {
        let (_dir, conn) = test_db();
        add_test_rule(&conn, "WALMART", "contains", "Supermercado", 0);
        match_user_rule(&conn, "WALMART 1").unwrap();
        match_user_rule(&conn, "WALMART 2").unwrap();
        assert_eq!(active_rules(&conn).unwrap()[0].hit_count, 2);
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let (_dir, conn) = test_db();
        assert!(add_rule(&conn, "([", "regex", TransactionKind::Expense, 1, None, 0).is_err());
    }

    #[test]
    fn test_deactivate_rule() {
        let (_dir, conn) = test_db();
        add_test_rule(&conn, "X", "contains", "Servicios", 0);
        let id = active_rules(&conn).unwrap()[0].id;
        assert!(deactivate_rule(&conn, id).unwrap());
        assert!(!deactivate_rule(&conn, id).unwrap());
        assert!(active_rules(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_merchant_credit_becomes_refund() {
        let (_dir, conn) = test_db();
        let c = classify(&conn, &movement("AMAZON MX DEVOL", false, 300)).unwrap();
        assert_eq!(c.kind, TransactionKind::Income);
        assert_eq!(c.category, "Reembolsos");
    }

    #[test]
    fn test_transfer_gets_counterparty() {
        let (_dir, conn) = test_db();
        let c = classify(&conn, &movement("SPEI ENVIADO BANORTE", true, 200)).unwrap();
        assert_eq!(c.kind, TransactionKind::Transfer);
        assert_eq!(c.linked_account.as_deref(), Some("Banorte - Cuenta Externa"));
    }
}
