//! Named per-user timestamps usable as history boundaries.

use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use tracing::info;
use walt_common::{Checkpoint, Store};

use crate::error::{RelayError, Result};

/// Checkpoint operations over the store.
#[derive(Clone)]
pub struct CheckpointBook {
    store: Arc<dyn Store>,
}

impl CheckpointBook {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Save a checkpoint, at `timestamp` or now.
    pub async fn add(
        &self,
        username: &str,
        name: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            name: name.to_string(),
            username: username.to_string(),
            timestamp: timestamp.unwrap_or_else(Utc::now),
        };
        if !self.store.insert_checkpoint(&checkpoint).await? {
            return Err(RelayError::CheckpointExists {
                username: username.to_string(),
                name: name.to_string(),
            });
        }
        info!(username, name, timestamp = %checkpoint.timestamp, "Checkpoint added");
        Ok(checkpoint)
    }

    pub async fn remove(&self, username: &str, name: &str) -> Result<()> {
        if !self.store.delete_checkpoint(username, name).await? {
            return Err(RelayError::CheckpointNotFound {
                username: username.to_string(),
                name: name.to_string(),
            });
        }
        info!(username, name, "Checkpoint removed");
        Ok(())
    }

    /// Checkpoints of a user, oldest first.
    pub async fn list(&self, username: &str) -> Result<Vec<Checkpoint>> {
        Ok(self.store.checkpoints(username).await?)
    }

    /// RFC 3339 timestamp of a checkpoint.
    pub async fn lookup(&self, username: &str, name: &str) -> Result<String> {
        let checkpoint = self.get(username, name).await?;
        Ok(format_timestamp(checkpoint.timestamp))
    }

    /// Interpret `text` as an RFC 3339 timestamp or a checkpoint name.
    pub async fn resolve_boundary(&self, username: &str, text: &str) -> Result<DateTime<Utc>> {
        if let Ok(timestamp) = DateTime::parse_from_rfc3339(text) {
            return Ok(timestamp.with_timezone(&Utc));
        }
        match self.store.checkpoint(username, text).await? {
            Some(checkpoint) => Ok(checkpoint.timestamp),
            None => Err(RelayError::InvalidTimestamp(text.to_string())),
        }
    }

    async fn get(&self, username: &str, name: &str) -> Result<Checkpoint> {
        self.store
            .checkpoint(username, name)
            .await?
            .ok_or_else(|| RelayError::CheckpointNotFound {
                username: username.to_string(),
                name: name.to_string(),
            })
    }
}

/// Format a timestamp the way checkpoints are displayed.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}
