//! Bank statement parsing.
//!
//! Statements share one column layout: date, description, cargo (debit),
//! abono (credit), running balance. Exports usually carry a few banner rows
//! before the header, so the header is located by scanning for the date token
//! in the first column.

use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;

use crate::error::{CuadraError, Result};
use crate::models::RawMovement;

const COL_DATE: usize = 0;
const COL_DESCRIPTION: usize = 1;
const COL_DEBIT: usize = 2;
const COL_CREDIT: usize = 3;
const COL_BALANCE: usize = 4;
const EXPECTED_COLUMNS: usize = 5;

const HEADER_TOKENS: &[&str] = &["FECHA", "DATE"];
const AMOUNT_HEADER_TOKENS: &[&str] = &["CARGO", "ABONO", "SALDO", "RETIRO", "DEPOSITO", "DEPÓSITO", "IMPORTE", "DEBIT", "CREDIT", "BALANCE", "AMOUNT"];

/// Lines the bank prints about itself rather than about a movement.
const NOISE_PATTERNS: &[&str] = &[
    "SALDO ANTERIOR",
    "SALDO INICIAL",
    "SALDO FINAL",
    "SALDO AL CORTE",
    "SALDO PROMEDIO",
    "TOTAL DE MOVIMIENTOS",
    "TOTAL CARGOS",
    "TOTAL ABONOS",
    "BEGINNING BALANCE",
    "ENDING BALANCE",
];

const MINUS_VARIANTS: &[char] = &['\u{2212}', '\u{2012}', '\u{2013}', '\u{2014}', '\u{FE63}', '\u{FF0D}'];

const SPANISH_MONTHS: &[(&str, &str)] = &[
    ("ENE", "01"),
    ("FEB", "02"),
    ("MAR", "03"),
    ("ABR", "04"),
    ("MAY", "05"),
    ("JUN", "06"),
    ("JUL", "07"),
    ("AGO", "08"),
    ("SEP", "09"),
    ("SET", "09"),
    ("OCT", "10"),
    ("NOV", "11"),
    ("DIC", "12"),
];

/// Result of parsing one statement file.
#[derive(Debug, Default)]
pub struct ParsedStatement {
    pub movements: Vec<RawMovement>,
    /// Data rows discarded for a bad date, empty description or bank noise.
    pub dropped: usize,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Field cleaning
// ---------------------------------------------------------------------------

fn reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:CLAVE DE RASTREO|REFERENCIA|REF|FOLIO|AUTORIZACION|AUT)\b[\s:.#]*([A-Z0-9]{4,})",
        )
        .expect("reference regex")
    })
}

/// Clean a locale-formatted amount. Blank or unparseable cells yield `None`.
pub fn clean_amount(raw: &str) -> Option<Decimal> {
    let mut s: String = raw
        .trim()
        .chars()
        .map(|c| if MINUS_VARIANTS.contains(&c) { '-' } else { c })
        .filter(|c| !c.is_whitespace() && *c != '"' && *c != '$' && *c != '\u{20AC}')
        .collect();
    for code in ["MXN", "USD", "EUR", "MN"] {
        s = s.replace(code, "");
    }
    if s.is_empty() || s == "-" {
        return None;
    }

    let mut negative = false;
    if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        negative = true;
        s = inner.to_string();
    }
    if let Some(rest) = s.strip_prefix('-') {
        negative = !negative;
        s = rest.to_string();
    } else if let Some(rest) = s.strip_suffix('-') {
        negative = !negative;
        s = rest.to_string();
    }

    // "1.234,56" style: dot groups thousands, comma marks decimals.
    let last_comma = s.rfind(',');
    let last_dot = s.rfind('.');
    let normalized = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => s.replace('.', "").replace(',', "."),
        (Some(c), None) if s.matches(',').count() == 1 && s.len() - c - 1 == 2 => s.replace(',', "."),
        _ => s.replace(',', ""),
    };

    let value = Decimal::from_str(&normalized).ok()?;
    Some(if negative { -value } else { value })
}

/// Amount with missing or garbled values defaulting to zero.
pub fn parse_amount(raw: &str) -> Decimal {
    clean_amount(raw).unwrap_or(Decimal::ZERO)
}

pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    // Excel epoch is 1899-12-30 (accounting for the 1900 leap year bug)
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    base.checked_add_signed(chrono::Duration::days(serial.trunc() as i64))
}

/// Parse a day/month/year date. Spanish month abbreviations, two-digit years,
/// ISO dates and Excel serial numbers are accepted as well.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let first = raw.trim().split_whitespace().next()?;
    let mut s = first.to_uppercase();

    if let Ok(serial) = s.parse::<f64>() {
        if (20_000.0..80_000.0).contains(&serial) {
            return excel_serial_to_date(serial);
        }
        return None;
    }

    for (name, number) in SPANISH_MONTHS {
        if s.contains(name) {
            s = s.replace(name, number);
            break;
        }
    }

    let segments: Vec<&str> = s.split(['/', '-', '.']).collect();
    if segments.len() != 3 {
        return None;
    }
    let formats: &[&str] = match (segments[0].len(), segments[2].len()) {
        (4, _) => &["%Y-%m-%d", "%Y/%m/%d"],
        (_, 2) => &["%d/%m/%y", "%d-%m-%y", "%d.%m.%y"],
        (_, 4) => &["%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y"],
        _ => return None,
    };
    formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&s, fmt).ok())
}

pub fn extract_reference(description: &str) -> Option<String> {
    reference_re()
        .captures(description)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_uppercase())
}

fn is_noise(description: &str) -> bool {
    let upper = description.to_uppercase();
    NOISE_PATTERNS.iter().any(|p| upper.contains(p))
}

/// The header starts with a date column and names at least one amount
/// column, so banners like "Fecha de corte: 31/01/2025" are skipped.
fn is_header_row(row: &[String]) -> bool {
    let starts_with_date = row
        .get(COL_DATE)
        .map(|cell| {
            let upper = cell.trim().to_uppercase();
            HEADER_TOKENS.iter().any(|t| upper.starts_with(t))
        })
        .unwrap_or(false);
    starts_with_date
        && row.iter().skip(1).any(|cell| {
            let upper = cell.to_uppercase();
            AMOUNT_HEADER_TOKENS.iter().any(|t| upper.contains(t))
        })
}

fn cell(row: &[String], idx: usize) -> &str {
    row.get(idx).map(|s| s.as_str()).unwrap_or("")
}

// ---------------------------------------------------------------------------
// Row normalization
// ---------------------------------------------------------------------------

/// Normalize the raw rows of a statement.
pub fn parse_rows(rows: &[Vec<String>]) -> Result<ParsedStatement> {
    let header_idx = rows
        .iter()
        .position(|r| is_header_row(r))
        .ok_or_else(|| {
            CuadraError::Format("no header row with a 'Fecha' column was found".into())
        })?;

    let header_width = rows[header_idx]
        .iter()
        .rposition(|c| !c.trim().is_empty())
        .map(|i| i + 1)
        .unwrap_or(0);
    if header_width < EXPECTED_COLUMNS {
        return Err(CuadraError::Format(format!(
            "expected {EXPECTED_COLUMNS} columns (fecha, descripción, cargo, abono, saldo), found {header_width}"
        )));
    }

    let mut parsed = ParsedStatement::default();
    let mut previous: Option<(Decimal, Decimal, Option<Decimal>)> = None;

    for (offset, row) in rows[header_idx + 1..].iter().enumerate() {
        let line_no = header_idx + offset + 2;
        if row.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        let Some(date) = parse_date(cell(row, COL_DATE)) else {
            parsed.dropped += 1;
            continue;
        };
        let description = cell(row, COL_DESCRIPTION).split_whitespace().collect::<Vec<_>>().join(" ");
        if description.is_empty() || is_noise(&description) {
            parsed.dropped += 1;
            continue;
        }

        let debit = parse_amount(cell(row, COL_DEBIT)).abs();
        let credit = parse_amount(cell(row, COL_CREDIT)).abs();
        let balance = clean_amount(cell(row, COL_BALANCE));

        let (is_debit, amount) = match (debit.is_zero(), credit.is_zero()) {
            (false, true) => (true, debit),
            (true, false) => (false, credit),
            (true, true) => {
                parsed.dropped += 1;
                continue;
            }
            (false, false) => {
                return Err(CuadraError::Format(format!(
                    "row {line_no} has both a cargo ({debit}) and an abono ({credit})"
                )));
            }
        };

        if let (Some((prev_debit, prev_credit, Some(prev_balance))), Some(current)) = (previous, balance) {
            let forward = prev_balance - debit + credit;
            let backward = current - prev_debit + prev_credit;
            let tolerance = Decimal::new(1, 2);
            if (forward - current).abs() > tolerance && (backward - prev_balance).abs() > tolerance {
                let msg = format!("row {line_no}: running balance {current} does not follow from the previous row");
                tracing::warn!("{msg}");
                parsed.warnings.push(msg);
            }
        }
        previous = Some((debit, credit, balance));

        parsed.movements.push(RawMovement {
            date,
            reference: extract_reference(&description),
            description,
            is_debit,
            amount,
            running_balance: balance,
        });
    }

    if parsed.movements.is_empty() {
        return Err(CuadraError::Format(
            "no movements found below the header row".into(),
        ));
    }
    Ok(parsed)
}

// ---------------------------------------------------------------------------
// File readers
// ---------------------------------------------------------------------------

/// Decode one CSV field. Exports from older banking portals are Latin-1, so
/// bytes that are not UTF-8 are read as ISO-8859-1 instead of being lost.
fn decode_field(bytes: &[u8]) -> (String, bool) {
    match std::str::from_utf8(bytes) {
        Ok(s) => (s.to_string(), false),
        Err(_) => (bytes.iter().map(|&b| char::from(b)).collect(), true),
    }
}

fn read_csv_rows(file_path: &Path) -> Result<(Vec<Vec<String>>, Vec<String>)> {
    let file = std::fs::File::open(file_path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(std::io::BufReader::new(file));
    let mut rows = Vec::new();
    let mut warnings = Vec::new();
    for result in rdr.byte_records() {
        let record = result?;
        let mut transcoded = false;
        let row: Vec<String> = record
            .iter()
            .map(|field| {
                let (text, latin1) = decode_field(field);
                transcoded |= latin1;
                text
            })
            .collect();
        if transcoded {
            let line = record.position().map(|p| p.line()).unwrap_or(rows.len() as u64 + 1);
            let msg = format!("row {line}: not valid UTF-8, read as Latin-1");
            tracing::warn!("{msg}");
            warnings.push(msg);
        }
        rows.push(row);
    }
    Ok((rows, warnings))
}

#[cfg(feature = "xlsx")]
fn read_spreadsheet_rows(file_path: &Path) -> Result<Vec<Vec<String>>> {
    use calamine::{Data, Reader};

    let mut workbook = calamine::open_workbook_auto(file_path)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| CuadraError::Format("workbook has no sheets".into()))??;

    let rows = range
        .rows()
        .map(|row| {
            row.iter()
                .map(|c| match c {
                    Data::String(s) | Data::DateTimeIso(s) => s.clone(),
                    Data::Float(f) => f.to_string(),
                    Data::Int(i) => i.to_string(),
                    Data::DateTime(dt) => excel_serial_to_date(dt.as_f64())
                        .map(|d| d.format("%d/%m/%Y").to_string())
                        .unwrap_or_default(),
                    Data::Bool(b) => b.to_string(),
                    _ => String::new(),
                })
                .collect()
        })
        .collect();
    Ok(rows)
}

#[cfg(feature = "pdf")]
fn pdf_row_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(\d{1,2}[/-](?:\d{1,2}|[A-Za-z]{3})[/-]\d{2,4})\s+(.+?)\s+(-?[\d,]+\.\d{2})\s+(-?[\d,]+\.\d{2})$",
        )
        .expect("pdf row regex")
    })
}

#[cfg(feature = "pdf")]
fn opening_balance_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)SALDO (?:ANTERIOR|INICIAL)\D*(-?[\d,]+\.\d{2})").expect("opening balance regex")
    })
}

/// PDF text loses the column boundaries, so each line carries one amount and
/// the balance after it. Direction comes from the balance delta.
#[cfg(feature = "pdf")]
fn pdf_text_to_rows(text: &str) -> Vec<Vec<String>> {
    const OUTFLOW_HINTS: &[&str] = &["ENVIADO", "PAGO", "CARGO", "COMPRA", "RETIRO", "COMISION"];

    let mut rows = vec![vec![
        "Fecha".to_string(),
        "Descripción".to_string(),
        "Cargo".to_string(),
        "Abono".to_string(),
        "Saldo".to_string(),
    ]];
    let mut previous_balance = opening_balance_re()
        .captures(text)
        .and_then(|c| clean_amount(&c[1]));

    for line in text.lines().map(str::trim) {
        let Some(caps) = pdf_row_re().captures(line) else { continue };
        let amount = parse_amount(&caps[3]).abs();
        let Some(balance) = clean_amount(&caps[4]) else { continue };
        let is_debit = match previous_balance {
            Some(prev) => balance < prev,
            None => {
                let upper = caps[2].to_uppercase();
                OUTFLOW_HINTS.iter().any(|h| upper.contains(h))
            }
        };
        previous_balance = Some(balance);
        let (debit, credit) = if is_debit {
            (amount.to_string(), String::new())
        } else {
            (String::new(), amount.to_string())
        };
        rows.push(vec![caps[1].to_string(), caps[2].to_string(), debit, credit, balance.to_string()]);
    }
    rows
}

#[cfg(feature = "pdf")]
fn read_pdf_rows(file_path: &Path) -> Result<Vec<Vec<String>>> {
    let text = pdf_extract::extract_text(file_path).map_err(|e| CuadraError::Pdf(e.to_string()))?;
    Ok(pdf_text_to_rows(&text))
}

/// Read and normalize a statement file, dispatching on its extension.
pub fn parse_statement(file_path: &Path) -> Result<ParsedStatement> {
    let ext = file_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let (rows, read_warnings) = match ext.as_str() {
        "csv" | "txt" => read_csv_rows(file_path)?,
        #[cfg(feature = "xlsx")]
        "xlsx" | "xlsm" | "xls" | "ods" => (read_spreadsheet_rows(file_path)?, Vec::new()),
        #[cfg(feature = "pdf")]
        "pdf" => (read_pdf_rows(file_path)?, Vec::new()),
        other => {
            return Err(CuadraError::Format(format!("unsupported statement file type: .{other}")));
        }
    };

    let mut parsed = parse_rows(&rows)?;
    parsed.warnings.splice(0..0, read_warnings);
    tracing::info!(
        file = %file_path.display(),
        movements = parsed.movements.len(),
        dropped = parsed.dropped,
        "Parsed statement"
    );
    Ok(parsed)
}
