//! Error types shared by the WALT daemons.

use thiserror::Error;

/// Errors raised by store and configuration operations.
#[derive(Debug, Error)]
pub enum WaltError {
    /// Redis connection or command failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored or transmitted JSON could not be (de)serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stored row could not be decoded
    #[error("Invalid data in {table}: {reason}")]
    InvalidData { table: String, reason: String },
}

impl WaltError {
    /// Creates an invalid data error for the given table.
    pub fn invalid_data(table: impl Into<String>, reason: impl Into<String>) -> Self {
        WaltError::InvalidData {
            table: table.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for store and configuration operations
pub type Result<T> = std::result::Result<T, WaltError>;
