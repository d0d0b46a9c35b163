//! Neighbour discovery abstraction.
//!
//! The tracker walks the fabric one host at a time through a
//! [`NeighborDiscovery`] implementation. [`crate::lldp::LldpBackend`] is the
//! production backend; tests plug in scripted fabrics.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use walt_common::MacAddress;

/// Host whose LLDP table is queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryHost {
    /// The server's own LLDP agent
    Local,
    /// A switch queried over SNMP
    Switch { ip: IpAddr },
}

impl fmt::Display for DiscoveryHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryHost::Local => f.write_str("local"),
            DiscoveryHost::Switch { ip } => write!(f, "switch {ip}"),
        }
    }
}

/// A neighbour seen on one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborInfo {
    pub mac: MacAddress,
    /// Management address, if the neighbour advertises a usable one
    pub ip: Option<IpAddr>,
}

/// Neighbours of a host keyed by local port number.
pub type PortNeighbors = BTreeMap<u32, NeighborInfo>;

/// Result of one discovery query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    Ready(PortNeighbors),
    /// The table is not complete yet; refresh and query again
    NeedsRetry { reason: String },
    /// The query itself failed
    Fatal { reason: String },
}

/// Source of LLDP neighbour tables.
#[async_trait]
pub trait NeighborDiscovery: Send + Sync {
    /// Query the neighbour table of `host`.
    async fn query(&self, host: DiscoveryHost) -> DiscoveryOutcome;

    /// Ask the local agent to refresh its protocol table.
    async fn refresh(&self);
}
