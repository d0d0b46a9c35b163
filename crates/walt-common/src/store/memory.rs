//! In-memory store backend.

use super::{LogCursor, Store};
use crate::error::Result;
use crate::types::{
    Checkpoint, Device, HistoryQuery, LogRecord, LogStream, MacAddress, StoredRecord,
    TopologyEdge,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Tables {
    devices: BTreeMap<MacAddress, Device>,
    edges: BTreeMap<MacAddress, TopologyEdge>,
    streams: Vec<LogStream>,
    logs: Vec<StoredRecord>,
    /// Keyed by (username, name)
    checkpoints: BTreeMap<(String, String), Checkpoint>,
}

/// Process-local store.
///
/// Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted log records.
    pub fn log_count(&self) -> usize {
        self.tables.lock().logs.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn device(&self, mac: MacAddress) -> Result<Option<Device>> {
        Ok(self.tables.lock().devices.get(&mac).cloned())
    }

    async fn device_by_ip(&self, ip: IpAddr) -> Result<Option<Device>> {
        Ok(self
            .tables
            .lock()
            .devices
            .values()
            .find(|d| d.ip == Some(ip))
            .cloned())
    }

    async fn devices(&self) -> Result<Vec<Device>> {
        Ok(self.tables.lock().devices.values().cloned().collect())
    }

    async fn upsert_device(&self, device: &Device) -> Result<()> {
        self.tables
            .lock()
            .devices
            .insert(device.mac, device.clone());
        Ok(())
    }

    async fn mark_all_unreachable(&self) -> Result<usize> {
        let mut tables = self.tables.lock();
        for device in tables.devices.values_mut() {
            device.reachable = false;
        }
        Ok(tables.devices.len())
    }

    async fn edge(&self, mac: MacAddress) -> Result<Option<TopologyEdge>> {
        Ok(self.tables.lock().edges.get(&mac).copied())
    }

    async fn edges(&self) -> Result<Vec<TopologyEdge>> {
        Ok(self.tables.lock().edges.values().copied().collect())
    }

    async fn insert_edge(&self, edge: &TopologyEdge) -> Result<()> {
        self.tables.lock().edges.insert(edge.mac, *edge);
        Ok(())
    }

    async fn delete_edge(&self, mac: MacAddress) -> Result<bool> {
        Ok(self.tables.lock().edges.remove(&mac).is_some())
    }

    async fn delete_edge_at(
        &self,
        switch_mac: MacAddress,
        switch_port: u32,
    ) -> Result<Option<MacAddress>> {
        let mut tables = self.tables.lock();
        let evicted = tables
            .edges
            .values()
            .find(|e| e.switch_mac == switch_mac && e.switch_port == switch_port)
            .map(|e| e.mac);
        if let Some(mac) = evicted {
            tables.edges.remove(&mac);
        }
        Ok(evicted)
    }

    async fn find_stream(
        &self,
        sender: Option<MacAddress>,
        name: &str,
    ) -> Result<Option<LogStream>> {
        Ok(self
            .tables
            .lock()
            .streams
            .iter()
            .find(|s| s.sender_mac == sender && s.name == name)
            .cloned())
    }

    async fn insert_stream(
        &self,
        sender: Option<MacAddress>,
        sender_name: Option<String>,
        name: &str,
    ) -> Result<LogStream> {
        let mut tables = self.tables.lock();
        let stream = LogStream {
            id: tables.streams.len() as u64 + 1,
            sender_mac: sender,
            sender_name,
            name: name.to_string(),
        };
        tables.streams.push(stream.clone());
        Ok(stream)
    }

    async fn append_log(&self, stream: &LogStream, record: LogRecord) -> Result<StoredRecord> {
        let mut tables = self.tables.lock();
        let stored = StoredRecord {
            id: tables.logs.len() as u64 + 1,
            stream: stream.clone(),
            record,
        };
        tables.logs.push(stored.clone());
        Ok(stored)
    }

    async fn last_log_id(&self) -> Result<u64> {
        Ok(self.tables.lock().logs.len() as u64)
    }

    fn scan_logs(&self, query: HistoryQuery, _batch_size: usize) -> LogCursor {
        let mut matching: Vec<StoredRecord> = self
            .tables
            .lock()
            .logs
            .iter()
            .filter(|r| query.contains(r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            (a.record.timestamp, a.id).cmp(&(b.record.timestamp, b.id))
        });
        stream::iter(matching.into_iter().map(Ok)).boxed()
    }

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<bool> {
        let mut tables = self.tables.lock();
        let key = (checkpoint.username.clone(), checkpoint.name.clone());
        if tables.checkpoints.contains_key(&key) {
            return Ok(false);
        }
        tables.checkpoints.insert(key, checkpoint.clone());
        Ok(true)
    }

    async fn delete_checkpoint(&self, username: &str, name: &str) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .checkpoints
            .remove(&(username.to_string(), name.to_string()))
            .is_some())
    }

    async fn checkpoint(&self, username: &str, name: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .tables
            .lock()
            .checkpoints
            .get(&(username.to_string(), name.to_string()))
            .cloned())
    }

    async fn checkpoints(&self, username: &str) -> Result<Vec<Checkpoint>> {
        let mut list: Vec<Checkpoint> = self
            .tables
            .lock()
            .checkpoints
            .values()
            .filter(|c| c.username == username)
            .cloned()
            .collect();
        list.sort_by(|a, b| (a.timestamp, &a.name).cmp(&(b.timestamp, &b.name)));
        Ok(list)
    }
}
