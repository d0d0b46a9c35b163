//! Error types for the log relay hub.

use thiserror::Error;
use walt_common::WaltError;

/// Log relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Store access failed
    #[error("Store error: {0}")]
    Store(#[from] WaltError),

    /// Socket error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame did not hold the expected JSON object
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Peer broke the connection protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Stream name filter is not a valid regular expression
    #[error("Invalid stream pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Checkpoint {name:?} already exists for user {username}")]
    CheckpointExists { username: String, name: String },

    #[error("No checkpoint {name:?} for user {username}")]
    CheckpointNotFound { username: String, name: String },

    /// Neither an RFC 3339 timestamp nor a known checkpoint
    #[error("Invalid timestamp or checkpoint: {0:?}")]
    InvalidTimestamp(String),
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_error_display() {
        let err = RelayError::CheckpointExists {
            username: "alice".to_string(),
            name: "boot".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Checkpoint \"boot\" already exists for user alice"
        );
    }
}
