//! Error types for the topology tracker.

use thiserror::Error;
use walt_common::WaltError;

/// Topology tracker errors.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// Store access failed
    #[error("Store error: {0}")]
    Store(#[from] WaltError),

    /// A discovery query failed for good
    #[error("Discovery failed on {host}: {reason}")]
    Discovery { host: String, reason: String },

    /// An external command could not be run
    #[error("Failed to execute command '{command}': {source}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for topology operations
pub type Result<T> = std::result::Result<T, TopologyError>;
