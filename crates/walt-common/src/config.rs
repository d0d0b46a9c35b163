//! Configuration file support
//!
//! Loads and validates the configuration shared by `walt-topologyd` and
//! `walt-logd` from a TOML file. Default location: /etc/walt/walt.conf

use crate::error::{Result, WaltError};
use crate::types::MacAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/walt/walt.conf";

/// Store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Store backend
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Redis host
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    /// Redis port
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Redis database number
    #[serde(default)]
    pub redis_db: u32,
}

/// Topology discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Interface connecting the server to the first switch
    #[serde(default = "default_server_interface")]
    pub server_interface: String,

    /// Server MAC, read from the interface when unset
    #[serde(default)]
    pub server_mac: Option<String>,

    /// SNMP community used to walk switch LLDP tables
    #[serde(default = "default_snmp_community")]
    pub snmp_community: String,

    /// Delay before retrying a switch whose neighbours are not resolvable yet
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// OUI prefixes (`aa:bb:cc`) of switch vendors
    #[serde(default = "default_switch_ouis")]
    pub switch_ouis: Vec<String>,

    /// OUI prefix to node model
    #[serde(default = "default_node_ouis")]
    pub node_ouis: BTreeMap<String, String>,
}

/// Log relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listen address for log producers
    #[serde(default = "default_producer_listen")]
    pub producer_listen: SocketAddr,

    /// Listen address for log subscribers
    #[serde(default = "default_subscriber_listen")]
    pub subscriber_listen: SocketAddr,

    /// Maximum number of queued dispatcher events
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,

    /// Records fetched per store round trip during history replay
    #[serde(default = "default_history_batch_size")]
    pub history_batch_size: usize,

    /// Largest accepted wire frame in bytes
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,

    /// Time a subscriber may leave a record unread before it is dropped
    #[serde(default = "default_subscriber_write_timeout_ms")]
    pub subscriber_write_timeout_ms: u64,
}

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaltConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub topology: TopologyConfig,

    #[serde(default)]
    pub relay: RelayConfig,
}

// Default functions
fn default_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_server_interface() -> String {
    "walt-net".to_string()
}

fn default_snmp_community() -> String {
    "public".to_string()
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_switch_ouis() -> Vec<String> {
    // Netgear and TP-Link managed switches
    vec![
        "a0:40:a0".to_string(),
        "e0:91:f5".to_string(),
        "50:c7:bf".to_string(),
    ]
}

fn default_node_ouis() -> BTreeMap<String, String> {
    [
        ("b8:27:eb", "rpi-3-b"),
        ("dc:a6:32", "rpi-4-b"),
        ("e4:5f:01", "rpi-4-b"),
        ("28:cd:c1", "rpi-5-b"),
    ]
    .into_iter()
    .map(|(oui, model)| (oui.to_string(), model.to_string()))
    .collect()
}

fn default_producer_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 12347))
}

fn default_subscriber_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 12348))
}

fn default_event_queue_depth() -> usize {
    1024
}

fn default_history_batch_size() -> usize {
    256
}

fn default_max_frame_length() -> usize {
    1024 * 1024
}

fn default_subscriber_write_timeout_ms() -> u64 {
    5000
}

// Default implementations
impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            redis_db: 0,
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            server_interface: default_server_interface(),
            server_mac: None,
            snmp_community: default_snmp_community(),
            retry_delay_ms: default_retry_delay_ms(),
            switch_ouis: default_switch_ouis(),
            node_ouis: default_node_ouis(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            producer_listen: default_producer_listen(),
            subscriber_listen: default_subscriber_listen(),
            event_queue_depth: default_event_queue_depth(),
            history_batch_size: default_history_batch_size(),
            max_frame_length: default_max_frame_length(),
            subscriber_write_timeout_ms: default_subscriber_write_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    /// Returns the Redis connection URI.
    pub fn redis_uri(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.redis_host, self.redis_port, self.redis_db
        )
    }
}

impl RelayConfig {
    /// Get the subscriber write timeout as Duration
    pub fn subscriber_write_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_write_timeout_ms)
    }
}

impl TopologyConfig {
    /// Get retry delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Resolve the server MAC, from the configuration or from sysfs.
    pub fn resolve_server_mac(&self) -> Result<MacAddress> {
        let text = match &self.server_mac {
            Some(mac) => mac.clone(),
            None => {
                let path = format!("/sys/class/net/{}/address", self.server_interface);
                fs::read_to_string(&path)?
            }
        };
        MacAddress::parse(&text)
            .ok_or_else(|| WaltError::Config(format!("invalid server MAC address: {text:?}")))
    }
}

impl WaltConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => {
                let config: WaltConfig = toml::from_str(&content).map_err(|e| {
                    WaltError::Config(format!(
                        "Failed to parse config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(WaltError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| WaltError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.backend == StoreBackend::Redis && self.database.redis_port == 0 {
            return Err(WaltError::Config("redis_port must be > 0".to_string()));
        }

        if let Some(mac) = &self.topology.server_mac {
            if MacAddress::parse(mac).is_none() {
                return Err(WaltError::Config(format!("invalid server_mac: {mac:?}")));
            }
        }

        for oui in self
            .topology
            .switch_ouis
            .iter()
            .chain(self.topology.node_ouis.keys())
        {
            if !is_valid_oui(oui) {
                return Err(WaltError::Config(format!("invalid OUI prefix: {oui:?}")));
            }
        }

        if self.relay.producer_listen == self.relay.subscriber_listen {
            return Err(WaltError::Config(
                "producer_listen and subscriber_listen must differ".to_string(),
            ));
        }

        if self.relay.event_queue_depth == 0 {
            return Err(WaltError::Config(
                "event_queue_depth must be > 0".to_string(),
            ));
        }

        if self.relay.history_batch_size == 0 {
            return Err(WaltError::Config(
                "history_batch_size must be > 0".to_string(),
            ));
        }

        if self.relay.subscriber_write_timeout_ms == 0 {
            return Err(WaltError::Config(
                "subscriber_write_timeout_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn is_valid_oui(oui: &str) -> bool {
    let parts: Vec<&str> = oui.split(':').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}
