use thiserror::Error;

#[derive(Error, Debug)]
pub enum CuadraError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[cfg(feature = "xlsx")]
    #[error("Spreadsheet error: {0}")]
    Spreadsheet(#[from] calamine::Error),

    #[error("PDF error: {0}")]
    Pdf(String),

    /// The input file does not match the expected bank layout.
    #[error("Statement format error: {0}")]
    Format(String),

    /// AI classification failed after retries or returned an invalid payload.
    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("Duplicate of transaction {existing_id}: {detail}")]
    DuplicateConflict { existing_id: i64, detail: String },

    #[error("Ledger integrity error: {0}")]
    LedgerIntegrity(String),

    #[error("Unbalanced group {group_id}: legs sum to {sum}")]
    BalanceInvariant { group_id: String, sum: String },

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Unknown category: {0}")]
    UnknownCategory(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

impl CuadraError {
    /// Errors that abort a single movement but never the batch.
    pub fn is_movement_scoped(&self) -> bool {
        matches!(
            self,
            Self::Classification(_) | Self::DuplicateConflict { .. } | Self::LedgerIntegrity(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CuadraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_movement_scoped_errors() {
        assert!(CuadraError::LedgerIntegrity("x".into()).is_movement_scoped());
        assert!(CuadraError::DuplicateConflict { existing_id: 1, detail: "d".into() }
            .is_movement_scoped());
        assert!(!CuadraError::Format("no header".into()).is_movement_scoped());
    }

    #[test]
    fn test_format_error_message() {
        let e = CuadraError::Format("no header row found".into());
        assert_eq!(e.to_string(), "Statement format error: no header row found");
    }
}
