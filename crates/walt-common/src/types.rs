//! Core types for topology tracking and log relaying
//!
//! Devices and topology edges are written by the topology tracker, log
//! streams, log records and checkpoints by the log relay hub. All of them are
//! plain data: persistence lives in [`crate::store`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// MAC address representation
///
/// Serialized as the lowercase colon-separated string so that stored rows
/// and wire objects stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Parse a MAC address.
    ///
    /// Accepts `00:11:22:33:44:55`, `00-11-22-33-44-55` and the SNMP
    /// Hex-STRING form `00 11 22 33 44 55`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let parts: Vec<&str> = if s.contains(':') {
            s.split(':').collect()
        } else if s.contains('-') {
            s.split('-').collect()
        } else {
            s.split_whitespace().collect()
        };
        if parts.len() != 6 {
            return None;
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() || part.len() > 2 {
                return None;
            }
            bytes[i] = u8::from_str_radix(part, 16).ok()?;
        }
        Some(Self(bytes))
    }

    /// Returns the organizationally unique identifier (first three bytes)
    /// as `aa:bb:cc`.
    pub fn oui(&self) -> String {
        format!("{:02x}:{:02x}:{:02x}", self.0[0], self.0[1], self.0[2])
    }

    /// Returns the last two bytes as four hex digits, used to build display
    /// names of newly discovered devices.
    pub fn suffix(&self) -> String {
        format!("{:02x}{:02x}", self.0[4], self.0[5])
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid MAC address: {s:?}"))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind of a discovered device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Test node, with its board model (e.g. `rpi-4-b`)
    Node { model: String },
    /// Ethernet switch answering LLDP queries
    Switch,
    /// The WALT server itself
    Server,
}

impl DeviceType {
    /// Model used for nodes whose hardware address matches no known vendor
    pub const UNKNOWN_MODEL: &'static str = "unknown";

    /// Creates a node type for the given model.
    pub fn node(model: impl Into<String>) -> Self {
        DeviceType::Node {
            model: model.into(),
        }
    }

    /// Stored type tag: `switch`, `server` or `node:<model>`.
    pub fn tag(&self) -> String {
        match self {
            DeviceType::Node { model } => format!("node:{model}"),
            DeviceType::Switch => "switch".to_string(),
            DeviceType::Server => "server".to_string(),
        }
    }

    /// Parse a stored type tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "switch" => Some(DeviceType::Switch),
            "server" => Some(DeviceType::Server),
            other => other
                .strip_prefix("node:")
                .filter(|model| !model.is_empty())
                .map(DeviceType::node),
        }
    }

    /// Short label used in synthesized device names.
    pub fn label(&self) -> &str {
        match self {
            DeviceType::Node { model } => model,
            DeviceType::Switch => "switch",
            DeviceType::Server => "server",
        }
    }

    #[inline]
    pub fn is_switch(&self) -> bool {
        matches!(self, DeviceType::Switch)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

impl Serialize for DeviceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.tag())
    }
}

impl<'de> Deserialize<'de> for DeviceType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        DeviceType::from_tag(&tag)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown device type: {tag:?}")))
    }
}

/// Device identity record, keyed by hardware address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub mac: MacAddress,
    pub name: String,
    pub device_type: DeviceType,
    pub ip: Option<IpAddr>,
    /// Set when the device was observed during the latest rescan
    pub reachable: bool,
}

/// Connection of a device to a switch port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopologyEdge {
    /// The connected device
    pub mac: MacAddress,
    pub switch_mac: MacAddress,
    pub switch_port: u32,
}

/// Named, sender-attributed sequence of log records
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogStream {
    pub id: u64,
    /// Unresolvable senders are stored without a hardware address
    pub sender_mac: Option<MacAddress>,
    /// Display name of the sender when the stream was created
    pub sender_name: Option<String>,
    pub name: String,
}

/// A log line as sent by a producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

impl LogRecord {
    pub fn new(timestamp: DateTime<Utc>, line: impl Into<String>) -> Self {
        Self {
            timestamp,
            line: line.into(),
        }
    }
}

/// A persisted log record with its stream metadata.
///
/// `id` is assigned by the store and strictly increases in persistence
/// order. This is also the object pushed to log subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: u64,
    pub stream: LogStream,
    pub record: LogRecord,
}

/// Saved per-user timestamp marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub username: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounds of a historical log scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Records with a greater id are left to the live path
    pub max_id: u64,
}

impl HistoryQuery {
    /// Returns true if `record` falls inside these bounds.
    pub fn contains(&self, record: &StoredRecord) -> bool {
        record.id <= self.max_id
            && record.record.timestamp >= self.start
            && record.record.timestamp <= self.end
    }
}
