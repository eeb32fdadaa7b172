use thiserror::Error;

use crate::types::run::RunResult;

/// Failures of the run history store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Run invariant violated: {0}")]
    Invariant(String),
}

/// Failures of a detection call.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("Empty batch: at least one metric point is required")]
    EmptyBatch,

    #[error("Malformed point at row {row}: field '{field}' {reason}")]
    MalformedPoint {
        row: usize,
        field: String,
        reason: String,
    },

    #[error("Malformed batch: {0}")]
    MalformedBatch(String),

    #[error("Invalid config: {name} - {reason}")]
    InvalidConfig { name: String, reason: String },

    /// Detection finished but the run could not be persisted. The computed
    /// result is returned so the caller can retry the save.
    #[error("Detection computed but not saved: {source}")]
    NotSaved {
        result: Box<RunResult>,
        #[source]
        source: StoreError,
    },
}

impl DetectError {
    /// True for errors caused by the caller's input or configuration.
    pub fn is_input_error(&self) -> bool {
        !matches!(self, DetectError::NotSaved { .. })
    }

    pub(crate) fn malformed(row: usize, field: &str, reason: impl Into<String>) -> Self {
        DetectError::MalformedPoint {
            row,
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DetectError>;
