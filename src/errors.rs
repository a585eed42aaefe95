use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Lock unavailable: {key} (waited {waited:?})")]
    LockUnavailable { key: String, waited: Duration },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("{tool} exited with code {code:?}: {stderr}")]
    ToolInvocation {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Chain integrity failure: {0}")]
    ChainIntegrity(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl BackupError {
    /// Whether the retry policy may attempt the operation again.
    pub fn is_transient(&self) -> bool {
        match self {
            BackupError::Transient(_) | BackupError::Storage(_) | BackupError::Io(_) => true,
            BackupError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    pub fn tool_failure(tool: &str, code: Option<i32>, stderr: impl Into<String>) -> Self {
        BackupError::ToolInvocation {
            tool: tool.to_string(),
            code,
            stderr: stderr.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
