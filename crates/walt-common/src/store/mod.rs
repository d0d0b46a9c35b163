//! Persistent store for devices, topology, log streams and checkpoints.
//!
//! The [`Store`] trait exposes the table operations the daemons need. Two
//! backends implement it:
//!
//! - [`RedisStore`]: production backend on a Redis server
//! - [`MemoryStore`]: process-local tables, used by tests and single-process
//!   deployments
//!
//! Store handles are cheap to clone and are passed explicitly to the
//! components that use them.

mod memory;
mod redis_backend;

pub use self::memory::MemoryStore;
pub use self::redis_backend::RedisStore;

use crate::config::{DatabaseConfig, StoreBackend};
use crate::error::Result;
use crate::types::{
    Checkpoint, Device, HistoryQuery, LogRecord, LogStream, MacAddress, StoredRecord,
    TopologyEdge,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

/// Server-side cursor over stored log records.
///
/// Yields records in `(timestamp, id)` order and fetches them from the
/// backend lazily.
pub type LogCursor = BoxStream<'static, Result<StoredRecord>>;

/// Table operations shared by the topology tracker and the log relay.
#[async_trait]
pub trait Store: Send + Sync {
    /// Select a device by hardware address.
    async fn device(&self, mac: MacAddress) -> Result<Option<Device>>;

    /// Select the device currently owning `ip`.
    async fn device_by_ip(&self, ip: IpAddr) -> Result<Option<Device>>;

    /// Select all devices, sorted by hardware address.
    async fn devices(&self) -> Result<Vec<Device>>;

    /// Insert or replace a device row.
    async fn upsert_device(&self, device: &Device) -> Result<()>;

    /// Set `reachable = false` on every device. Returns the device count.
    async fn mark_all_unreachable(&self) -> Result<usize>;

    /// Select the edge of a device.
    async fn edge(&self, mac: MacAddress) -> Result<Option<TopologyEdge>>;

    /// Select all edges, sorted by device hardware address.
    async fn edges(&self) -> Result<Vec<TopologyEdge>>;

    /// Insert an edge. Callers clear conflicting rows first.
    async fn insert_edge(&self, edge: &TopologyEdge) -> Result<()>;

    /// Delete the edge of a device. Returns true if one existed.
    async fn delete_edge(&self, mac: MacAddress) -> Result<bool>;

    /// Delete the edge recorded at a switch port, returning the evicted device.
    async fn delete_edge_at(
        &self,
        switch_mac: MacAddress,
        switch_port: u32,
    ) -> Result<Option<MacAddress>>;

    /// Find a log stream by sender and name.
    async fn find_stream(&self, sender: Option<MacAddress>, name: &str)
        -> Result<Option<LogStream>>;

    /// Create a log stream and assign its id.
    async fn insert_stream(
        &self,
        sender: Option<MacAddress>,
        sender_name: Option<String>,
        name: &str,
    ) -> Result<LogStream>;

    /// Persist a record, assigning the next record id.
    async fn append_log(&self, stream: &LogStream, record: LogRecord) -> Result<StoredRecord>;

    /// Highest record id assigned so far (0 when no record exists).
    async fn last_log_id(&self) -> Result<u64>;

    /// Open a cursor over records matching `query`, fetching
    /// `batch_size` records per round trip.
    ///
    /// Records come in timestamp order, ties broken by id. This is arrival
    /// order within a stream as long as its producer's timestamps never go
    /// backwards; live delivery always follows arrival order.
    fn scan_logs(&self, query: HistoryQuery, batch_size: usize) -> LogCursor;

    /// Insert a checkpoint unless (name, username) already exists.
    /// Returns false, leaving the table unchanged, on conflict.
    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<bool>;

    /// Delete a checkpoint. Returns false if it did not exist.
    async fn delete_checkpoint(&self, username: &str, name: &str) -> Result<bool>;

    /// Select one checkpoint.
    async fn checkpoint(&self, username: &str, name: &str) -> Result<Option<Checkpoint>>;

    /// Select the checkpoints of a user, sorted by timestamp.
    async fn checkpoints(&self, username: &str) -> Result<Vec<Checkpoint>>;
}

/// Open the store selected by the configuration.
pub async fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn Store>> {
    match config.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(config).await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
