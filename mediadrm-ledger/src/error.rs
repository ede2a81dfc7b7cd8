//! Error types for the ledger.

use thiserror::Error;

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors raised by the secure stop ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// SQLite failure.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored row could not be decoded.
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

impl LedgerError {
    pub(crate) fn db(context: &str, err: rusqlite::Error) -> Self {
        Self::Database(format!("{context}: {err}"))
    }
}
