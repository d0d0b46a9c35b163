//! Shared infrastructure for the WALT fabric daemons.
//!
//! This crate holds everything `walt-topologyd` and `walt-logd` have in
//! common:
//!
//! - [`types`]: devices, topology edges, log streams, log records, checkpoints
//! - [`store`]: the [`Store`] trait with its Redis and in-memory backends
//! - [`config`]: TOML configuration shared by both daemons
//! - [`error`]: error types for store and configuration operations
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐                        ┌────────────────┐
//! │ walt-topologyd │──── devices/edges ────▶│                │
//! └────────────────┘                        │  Store         │
//!                                           │  (Redis or     │
//! ┌────────────────┐                        │   memory)      │
//! │ walt-logd      │── streams/logs/ckpt ──▶│                │
//! └────────────────┘                        └────────────────┘
//! ```
//!
//! Neither daemon keeps process-wide state: a [`Store`] handle and the
//! loaded [`WaltConfig`] are passed explicitly to the components that need
//! them.

pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use config::{DatabaseConfig, RelayConfig, StoreBackend, TopologyConfig, WaltConfig};
pub use error::{Result, WaltError};
pub use store::{open_store, LogCursor, MemoryStore, RedisStore, Store};
pub use types::{
    Checkpoint, Device, DeviceType, HistoryQuery, LogRecord, LogStream, MacAddress, StoredRecord,
    TopologyEdge,
};
