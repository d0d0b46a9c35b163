//! WALT topology tracker.
//!
//! Discovers switches, nodes and the server through LLDP and keeps the
//! device and topology tables of the store current.
//!
//! # Discovery walk
//!
//! ```text
//! server (lldpctl) ──▶ switch A (snmpwalk) ──▶ switch B (snmpwalk) ──▶ ...
//!                        │                       │
//!                        ├─ port 1: node         ├─ port 1: node
//!                        └─ port 2: node         └─ ...
//! ```
//!
//! Every device seen gets a row in the device table; every device seen on a
//! switch port gets an edge `(switch, port)`. A device which lost its edge
//! after a completed rescan is reported as replaced by
//! [`TopologyTracker::show`].

pub mod classify;
pub mod discovery;
pub mod error;
pub mod lldp;
pub mod render;
pub mod shell;
pub mod tracker;

pub use classify::DeviceClassifier;
pub use discovery::{DiscoveryHost, DiscoveryOutcome, NeighborDiscovery, NeighborInfo, PortNeighbors};
pub use error::{Result, TopologyError};
pub use lldp::LldpBackend;
pub use render::{TopologySnapshot, TreeLines};
pub use tracker::{device_name, DeviceUpdate, RescanReport, TopologyTracker, Walk, SERVER_NAME};
