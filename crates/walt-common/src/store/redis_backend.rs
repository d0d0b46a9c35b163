//! Redis store backend.
//!
//! # Key layout
//!
//! | key | type | content |
//! |-----|------|---------|
//! | `DEVICES` | set | hardware addresses of all devices |
//! | `DEVICE\|<mac>` | hash | `name`, `type`, `ip`, `reachable` |
//! | `DEVICE_BY_IP` | hash | ip → mac |
//! | `TOPOLOGY` | set | hardware addresses having an edge |
//! | `TOPOLOGY\|<mac>` | hash | `switch_mac`, `switch_port` |
//! | `TOPOLOGY_SLOT\|<switch_mac>\|<port>` | string | mac of the device in that slot |
//! | `LOG_STREAM_ID` / `LOG_ID` | counter | last assigned ids |
//! | `LOG_STREAM\|<id>` | hash | `sender_mac`, `sender_name`, `name` |
//! | `LOG_STREAM_KEY\|<sender>\|<name>` | string | stream id |
//! | `LOGS` | sorted set | score: timestamp (ms), member: `<id:020>\|<json>` |
//! | `CHECKPOINTS\|<user>` | set | checkpoint names |
//! | `CHECKPOINT\|<user>\|<name>` | hash | `timestamp` |

use super::{LogCursor, Store};
use crate::config::DatabaseConfig;
use crate::error::{Result, WaltError};
use crate::types::{
    Checkpoint, Device, DeviceType, HistoryQuery, LogRecord, LogStream, MacAddress,
    StoredRecord, TopologyEdge,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info, instrument};

const DEVICES_KEY: &str = "DEVICES";
const DEVICE_TABLE: &str = "DEVICE";
const DEVICE_BY_IP_KEY: &str = "DEVICE_BY_IP";
const TOPOLOGY_KEY: &str = "TOPOLOGY";
const TOPOLOGY_SLOT_TABLE: &str = "TOPOLOGY_SLOT";
const LOG_STREAM_TABLE: &str = "LOG_STREAM";
const LOG_STREAM_KEY_TABLE: &str = "LOG_STREAM_KEY";
const LOG_STREAM_ID_KEY: &str = "LOG_STREAM_ID";
const LOG_ID_KEY: &str = "LOG_ID";
const LOGS_KEY: &str = "LOGS";
const CHECKPOINTS_TABLE: &str = "CHECKPOINTS";
const CHECKPOINT_TABLE: &str = "CHECKPOINT";

/// Placeholder for a stream without a resolved sender
const NO_SENDER: &str = "-";

/// Redis-backed store
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connect to the configured Redis database.
    #[instrument(skip_all, fields(uri = %config.redis_uri()))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let uri = config.redis_uri();
        let client = Client::open(uri.as_str())?;
        let connection = ConnectionManager::new(client).await?;
        info!(host = %config.redis_host, db = config.redis_db, "Connected to Redis");
        Ok(Self { connection })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }

    async fn load_device(&self, mac: MacAddress) -> Result<Option<Device>> {
        let key = format!("{DEVICE_TABLE}|{mac}");
        let fields: HashMap<String, String> = self.conn().hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_device(mac, &fields).map(Some)
    }

    async fn load_edge(&self, mac: MacAddress) -> Result<Option<TopologyEdge>> {
        let key = format!("{TOPOLOGY_KEY}|{mac}");
        let fields: HashMap<String, String> = self.conn().hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_edge(mac, &fields).map(Some)
    }

    async fn load_stream(&self, id: u64) -> Result<Option<LogStream>> {
        let key = format!("{LOG_STREAM_TABLE}|{id}");
        let fields: HashMap<String, String> = self.conn().hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_stream(id, &fields).map(Some)
    }

    async fn remove_edge(&self, edge: &TopologyEdge) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .del(format!("{TOPOLOGY_KEY}|{}", edge.mac))
            .del(slot_key(edge.switch_mac, edge.switch_port))
            .srem(TOPOLOGY_KEY, edge.mac.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

fn slot_key(switch_mac: MacAddress, switch_port: u32) -> String {
    format!("{TOPOLOGY_SLOT_TABLE}|{switch_mac}|{switch_port}")
}

fn stream_key(sender: Option<MacAddress>, name: &str) -> String {
    let sender = sender.map_or_else(|| NO_SENDER.to_string(), |m| m.to_string());
    format!("{LOG_STREAM_KEY_TABLE}|{sender}|{name}")
}

fn field<'a>(table: &str, fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| WaltError::invalid_data(table, format!("missing field {name}")))
}

fn decode_device(mac: MacAddress, fields: &HashMap<String, String>) -> Result<Device> {
    let tag = field(DEVICE_TABLE, fields, "type")?;
    let device_type = DeviceType::from_tag(tag)
        .ok_or_else(|| WaltError::invalid_data(DEVICE_TABLE, format!("bad type {tag:?}")))?;
    let ip = match fields.get("ip").map(String::as_str) {
        None | Some("") => None,
        Some(text) => Some(text.parse::<IpAddr>().map_err(|e| {
            WaltError::invalid_data(DEVICE_TABLE, format!("bad ip {text:?}: {e}"))
        })?),
    };
    Ok(Device {
        mac,
        name: field(DEVICE_TABLE, fields, "name")?.to_string(),
        device_type,
        ip,
        reachable: fields.get("reachable").map(String::as_str) == Some("1"),
    })
}

fn decode_edge(mac: MacAddress, fields: &HashMap<String, String>) -> Result<TopologyEdge> {
    let switch_mac = field(TOPOLOGY_KEY, fields, "switch_mac")?;
    let switch_port = field(TOPOLOGY_KEY, fields, "switch_port")?;
    Ok(TopologyEdge {
        mac,
        switch_mac: MacAddress::parse(switch_mac).ok_or_else(|| {
            WaltError::invalid_data(TOPOLOGY_KEY, format!("bad switch_mac {switch_mac:?}"))
        })?,
        switch_port: switch_port.parse().map_err(|_| {
            WaltError::invalid_data(TOPOLOGY_KEY, format!("bad switch_port {switch_port:?}"))
        })?,
    })
}

fn decode_stream(id: u64, fields: &HashMap<String, String>) -> Result<LogStream> {
    let sender = field(LOG_STREAM_TABLE, fields, "sender_mac")?;
    let sender_mac = if sender == NO_SENDER {
        None
    } else {
        Some(MacAddress::parse(sender).ok_or_else(|| {
            WaltError::invalid_data(LOG_STREAM_TABLE, format!("bad sender_mac {sender:?}"))
        })?)
    };
    Ok(LogStream {
        id,
        sender_mac,
        sender_name: fields
            .get("sender_name")
            .filter(|n| !n.is_empty())
            .cloned(),
        name: field(LOG_STREAM_TABLE, fields, "name")?.to_string(),
    })
}

/// Encode a stored record as a `LOGS` member.
///
/// The zero-padded id prefix makes members with equal scores sort by id.
fn encode_log_member(record: &StoredRecord) -> Result<String> {
    Ok(format!("{:020}|{}", record.id, serde_json::to_string(record)?))
}

fn decode_log_member(member: &str) -> Result<StoredRecord> {
    let (_, json) = member
        .split_once('|')
        .ok_or_else(|| WaltError::invalid_data(LOGS_KEY, "member without id prefix"))?;
    Ok(serde_json::from_str(json)?)
}

/// Cursor position inside the `LOGS` sorted set.
///
/// Paging restarts at the last seen score and skips the members already
/// returned with that score. Records appended concurrently carry larger ids
/// and therefore never shift members already returned.
struct ScanState {
    connection: ConnectionManager,
    min_score: i64,
    skip: usize,
    max_score: i64,
    batch_size: usize,
    exhausted: bool,
}

impl ScanState {
    async fn next_batch(mut self) -> Result<Option<(Vec<StoredRecord>, ScanState)>> {
        if self.exhausted {
            return Ok(None);
        }
        let rows: Vec<(String, f64)> = self
            .connection
            .zrangebyscore_limit_withscores(
                LOGS_KEY,
                self.min_score,
                self.max_score,
                self.skip as isize,
                self.batch_size as isize,
            )
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        self.exhausted = rows.len() < self.batch_size;

        let mut batch = Vec::with_capacity(rows.len());
        for (member, score) in rows {
            let score = score as i64;
            if score == self.min_score {
                self.skip += 1;
            } else {
                self.min_score = score;
                self.skip = 1;
            }
            batch.push(decode_log_member(&member)?);
        }
        debug!(count = batch.len(), "Fetched history batch");
        Ok(Some((batch, self)))
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn device(&self, mac: MacAddress) -> Result<Option<Device>> {
        self.load_device(mac).await
    }

    async fn device_by_ip(&self, ip: IpAddr) -> Result<Option<Device>> {
        let mac: Option<String> = self.conn().hget(DEVICE_BY_IP_KEY, ip.to_string()).await?;
        match mac.as_deref().and_then(MacAddress::parse) {
            Some(mac) => self.load_device(mac).await,
            None => Ok(None),
        }
    }

    async fn devices(&self) -> Result<Vec<Device>> {
        let members: Vec<String> = self.conn().smembers(DEVICES_KEY).await?;
        let mut macs: Vec<MacAddress> = members.iter().filter_map(|m| MacAddress::parse(m)).collect();
        macs.sort();

        let mut devices = Vec::with_capacity(macs.len());
        for mac in macs {
            if let Some(device) = self.load_device(mac).await? {
                devices.push(device);
            }
        }
        Ok(devices)
    }

    #[instrument(skip(self), fields(mac = %device.mac))]
    async fn upsert_device(&self, device: &Device) -> Result<()> {
        let previous_ip = self.load_device(device.mac).await?.and_then(|d| d.ip);
        let key = format!("{DEVICE_TABLE}|{}", device.mac);
        let fields: Vec<(&str, String)> = vec![
            ("name", device.name.clone()),
            ("type", device.device_type.tag()),
            ("ip", device.ip.map(|ip| ip.to_string()).unwrap_or_default()),
            ("reachable", if device.reachable { "1" } else { "0" }.to_string()),
        ];

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&key, &fields)
            .sadd(DEVICES_KEY, device.mac.to_string());
        if let Some(old) = previous_ip.filter(|old| Some(*old) != device.ip) {
            pipe.hdel(DEVICE_BY_IP_KEY, old.to_string());
        }
        if let Some(ip) = device.ip {
            pipe.hset(DEVICE_BY_IP_KEY, ip.to_string(), device.mac.to_string());
        }
        let _: () = pipe.query_async(&mut self.conn()).await?;
        debug!(name = %device.name, "Upserted device");
        Ok(())
    }

    async fn mark_all_unreachable(&self) -> Result<usize> {
        let members: Vec<String> = self.conn().smembers(DEVICES_KEY).await?;
        if members.is_empty() {
            return Ok(0);
        }
        let mut pipe = redis::pipe();
        for mac in &members {
            pipe.hset(format!("{DEVICE_TABLE}|{mac}"), "reachable", "0");
        }
        let _: () = pipe.query_async(&mut self.conn()).await?;
        Ok(members.len())
    }

    async fn edge(&self, mac: MacAddress) -> Result<Option<TopologyEdge>> {
        self.load_edge(mac).await
    }

    async fn edges(&self) -> Result<Vec<TopologyEdge>> {
        let members: Vec<String> = self.conn().smembers(TOPOLOGY_KEY).await?;
        let mut macs: Vec<MacAddress> = members.iter().filter_map(|m| MacAddress::parse(m)).collect();
        macs.sort();

        let mut edges = Vec::with_capacity(macs.len());
        for mac in macs {
            if let Some(edge) = self.load_edge(mac).await? {
                edges.push(edge);
            }
        }
        Ok(edges)
    }

    #[instrument(skip(self), fields(mac = %edge.mac))]
    async fn insert_edge(&self, edge: &TopologyEdge) -> Result<()> {
        let key = format!("{TOPOLOGY_KEY}|{}", edge.mac);
        let fields: Vec<(&str, String)> = vec![
            ("switch_mac", edge.switch_mac.to_string()),
            ("switch_port", edge.switch_port.to_string()),
        ];
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields)
            .set(
                slot_key(edge.switch_mac, edge.switch_port),
                edge.mac.to_string(),
            )
            .sadd(TOPOLOGY_KEY, edge.mac.to_string())
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn delete_edge(&self, mac: MacAddress) -> Result<bool> {
        match self.load_edge(mac).await? {
            Some(edge) => {
                self.remove_edge(&edge).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_edge_at(
        &self,
        switch_mac: MacAddress,
        switch_port: u32,
    ) -> Result<Option<MacAddress>> {
        let owner: Option<String> = self.conn().get(slot_key(switch_mac, switch_port)).await?;
        let Some(owner) = owner.as_deref().and_then(MacAddress::parse) else {
            return Ok(None);
        };
        self.remove_edge(&TopologyEdge {
            mac: owner,
            switch_mac,
            switch_port,
        })
        .await?;
        Ok(Some(owner))
    }

    async fn find_stream(
        &self,
        sender: Option<MacAddress>,
        name: &str,
    ) -> Result<Option<LogStream>> {
        let id: Option<u64> = self.conn().get(stream_key(sender, name)).await?;
        match id {
            Some(id) => self.load_stream(id).await,
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn insert_stream(
        &self,
        sender: Option<MacAddress>,
        sender_name: Option<String>,
        name: &str,
    ) -> Result<LogStream> {
        let id: u64 = self.conn().incr(LOG_STREAM_ID_KEY, 1u64).await?;
        let stream = LogStream {
            id,
            sender_mac: sender,
            sender_name,
            name: name.to_string(),
        };
        let fields: Vec<(&str, String)> = vec![
            (
                "sender_mac",
                sender.map_or_else(|| NO_SENDER.to_string(), |m| m.to_string()),
            ),
            ("sender_name", stream.sender_name.clone().unwrap_or_default()),
            ("name", stream.name.clone()),
        ];
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(format!("{LOG_STREAM_TABLE}|{id}"), &fields)
            .set(stream_key(sender, name), id)
            .query_async(&mut self.conn())
            .await?;
        Ok(stream)
    }

    async fn append_log(&self, stream: &LogStream, record: LogRecord) -> Result<StoredRecord> {
        let id: u64 = self.conn().incr(LOG_ID_KEY, 1u64).await?;
        let stored = StoredRecord {
            id,
            stream: stream.clone(),
            record,
        };
        let member = encode_log_member(&stored)?;
        let score = stored.record.timestamp.timestamp_millis();
        let _: () = self.conn().zadd(LOGS_KEY, member, score).await?;
        Ok(stored)
    }

    async fn last_log_id(&self) -> Result<u64> {
        let id: Option<u64> = self.conn().get(LOG_ID_KEY).await?;
        Ok(id.unwrap_or(0))
    }

    fn scan_logs(&self, query: HistoryQuery, batch_size: usize) -> LogCursor {
        let state = ScanState {
            connection: self.conn(),
            min_score: query.start.timestamp_millis(),
            skip: 0,
            max_score: query.end.timestamp_millis(),
            batch_size: batch_size.max(1),
            exhausted: false,
        };
        stream::try_unfold(state, ScanState::next_batch)
            .map_ok(|batch| stream::iter(batch.into_iter().map(Ok)))
            .try_flatten()
            .try_filter(move |record| futures::future::ready(query.contains(record)))
            .boxed()
    }

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<bool> {
        let key = format!(
            "{CHECKPOINT_TABLE}|{}|{}",
            checkpoint.username, checkpoint.name
        );
        let created: bool = self
            .conn()
            .hset_nx(&key, "timestamp", checkpoint.timestamp.to_rfc3339())
            .await?;
        if created {
            let _: () = self
                .conn()
                .sadd(
                    format!("{CHECKPOINTS_TABLE}|{}", checkpoint.username),
                    &checkpoint.name,
                )
                .await?;
        }
        Ok(created)
    }

    async fn delete_checkpoint(&self, username: &str, name: &str) -> Result<bool> {
        let (deleted, _): (u64, u64) = redis::pipe()
            .atomic()
            .del(format!("{CHECKPOINT_TABLE}|{username}|{name}"))
            .srem(format!("{CHECKPOINTS_TABLE}|{username}"), name)
            .query_async(&mut self.conn())
            .await?;
        Ok(deleted > 0)
    }

    async fn checkpoint(&self, username: &str, name: &str) -> Result<Option<Checkpoint>> {
        let stamp: Option<String> = self
            .conn()
            .hget(format!("{CHECKPOINT_TABLE}|{username}|{name}"), "timestamp")
            .await?;
        let Some(stamp) = stamp else {
            return Ok(None);
        };
        let timestamp = DateTime::parse_from_rfc3339(&stamp)
            .map_err(|e| WaltError::invalid_data(CHECKPOINT_TABLE, e.to_string()))?
            .with_timezone(&Utc);
        Ok(Some(Checkpoint {
            name: name.to_string(),
            username: username.to_string(),
            timestamp,
        }))
    }

    async fn checkpoints(&self, username: &str) -> Result<Vec<Checkpoint>> {
        let names: Vec<String> = self
            .conn()
            .smembers(format!("{CHECKPOINTS_TABLE}|{username}"))
            .await?;
        let mut list = Vec::with_capacity(names.len());
        for name in names {
            if let Some(checkpoint) = self.checkpoint(username, &name).await? {
                list.push(checkpoint);
            }
        }
        list.sort_by(|a, b| (a.timestamp, &a.name).cmp(&(b.timestamp, &b.name)));
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_decode_device() {
        let mac: MacAddress = "b8:27:eb:00:00:01".parse().unwrap();
        let device = decode_device(
            mac,
            &fields(&[
                ("name", "rpi-3-b-0001"),
                ("type", "node:rpi-3-b"),
                ("ip", "192.168.152.10"),
                ("reachable", "1"),
            ]),
        )
        .unwrap();
        assert_eq!(device.device_type, DeviceType::node("rpi-3-b"));
        assert_eq!(device.ip, Some("192.168.152.10".parse().unwrap()));
        assert!(device.reachable);
    }

    #[test]
    fn test_decode_device_without_ip() {
        let mac: MacAddress = "a0:40:a0:00:00:01".parse().unwrap();
        let device = decode_device(
            mac,
            &fields(&[("name", "switch-0001"), ("type", "switch"), ("ip", "")]),
        )
        .unwrap();
        assert_eq!(device.ip, None);
        assert!(!device.reachable);
    }

    #[test]
    fn test_decode_device_bad_type() {
        let mac = MacAddress([0; 6]);
        let result = decode_device(mac, &fields(&[("name", "x"), ("type", "router")]));
        assert!(matches!(result, Err(WaltError::InvalidData { .. })));
    }

    #[test]
    fn test_decode_edge() {
        let mac: MacAddress = "b8:27:eb:00:00:01".parse().unwrap();
        let edge = decode_edge(
            mac,
            &fields(&[("switch_mac", "a0:40:a0:00:00:01"), ("switch_port", "7")]),
        )
        .unwrap();
        assert_eq!(edge.switch_port, 7);
        assert_eq!(edge.switch_mac.to_string(), "a0:40:a0:00:00:01");
    }

    #[test]
    fn test_decode_stream_without_sender() {
        let stream = decode_stream(
            4,
            &fields(&[("sender_mac", "-"), ("sender_name", ""), ("name", "console")]),
        )
        .unwrap();
        assert_eq!(stream.sender_mac, None);
        assert_eq!(stream.sender_name, None);
        assert_eq!(stream.name, "console");
    }

    #[test]
    fn test_log_member_sorts_by_id() {
        let stream = LogStream {
            id: 1,
            sender_mac: None,
            sender_name: None,
            name: "console".to_string(),
        };
        let timestamp: DateTime<Utc> = "2026-03-01T10:00:00Z".parse().unwrap();
        let make = |id| StoredRecord {
            id,
            stream: stream.clone(),
            record: LogRecord::new(timestamp, "x"),
        };
        let nine = encode_log_member(&make(9)).unwrap();
        let ten = encode_log_member(&make(10)).unwrap();
        assert!(nine < ten);
        assert_eq!(decode_log_member(&ten).unwrap().id, 10);
    }

    #[test]
    fn test_stream_key() {
        let mac: MacAddress = "b8:27:eb:00:00:01".parse().unwrap();
        assert_eq!(
            stream_key(Some(mac), "console"),
            "LOG_STREAM_KEY|b8:27:eb:00:00:01|console"
        );
        assert_eq!(stream_key(None, "console"), "LOG_STREAM_KEY|-|console");
    }
}
