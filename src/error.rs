// 🚨 Error Taxonomy
// Fatal errors abort a run; row-level errors become RejectRecords.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the analytical store interface.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store operation exceeded {0:?}")]
    Timeout(Duration),

    #[error("schema version mismatch on {table}: found {found}, expected {expected}")]
    SchemaVersion {
        table: String,
        found: i64,
        expected: i64,
    },

    #[error("invalid table name: {0}")]
    InvalidTable(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("schema mismatch in {path}: missing columns {missing:?}")]
    SchemaMismatch { path: PathBuf, missing: Vec<String> },

    #[error("schema mismatch in {path}: column {column} has type {found}, expected {expected}")]
    ColumnType {
        path: PathBuf,
        column: String,
        found: String,
        expected: String,
    },

    #[error("malformed input {path}: {message}")]
    MalformedInput { path: PathBuf, message: String },

    #[error("row {position} rejected: {reason}")]
    RowValidation { position: usize, reason: String },

    #[error("load into {table} failed: {source}")]
    LoadFailed {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("{operation} timed out after {budget:?}")]
    Timeout { operation: String, budget: Duration },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Taxonomy name recorded in run manifests.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SchemaMismatch { .. } | PipelineError::ColumnType { .. } => {
                "SchemaMismatchError"
            }
            PipelineError::MalformedInput { .. } => "MalformedInputError",
            PipelineError::RowValidation { .. } => "RowValidationError",
            PipelineError::LoadFailed { .. } => "LoadFailedError",
            PipelineError::Timeout { .. } => "TimeoutError",
            PipelineError::Io { .. } => "IoError",
            PipelineError::Config(_) => "ConfigError",
            PipelineError::Cancelled => "Cancelled",
            PipelineError::Store(_) => "StoreError",
        }
    }

    /// Transient failures worth another attempt. A missing or unreadable
    /// file will not appear on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Io { source, .. } => !matches!(
                source.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        PipelineError::MalformedInput {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_follow_taxonomy() {
        let missing = PipelineError::SchemaMismatch {
            path: "tx.csv".into(),
            missing: vec!["amount".to_string()],
        };
        assert_eq!(missing.kind(), "SchemaMismatchError");

        let load = PipelineError::LoadFailed {
            table: "t".to_string(),
            source: StoreError::Unavailable("down".to_string()),
        };
        assert_eq!(load.kind(), "LoadFailedError");
        assert!(load.to_string().contains("store unavailable"));

        let timeout = PipelineError::Timeout {
            operation: "read".to_string(),
            budget: Duration::from_secs(1),
        };
        assert_eq!(timeout.kind(), "TimeoutError");
    }

    #[test]
    fn test_only_transient_io_is_retryable() {
        let io = PipelineError::Io {
            path: "x".into(),
            source: std::io::Error::new(std::io::ErrorKind::Interrupted, "eintr"),
        };
        assert!(io.is_retryable());

        let missing = PipelineError::Io {
            path: "x".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert!(!missing.is_retryable());
        assert!(!PipelineError::malformed("x", "bad").is_retryable());
        assert!(!PipelineError::Cancelled.is_retryable());
    }
}
