//! The relay dispatcher.
//!
//! One task owns the hub, the store handle and the producer table, and
//! handles every [`RelayEvent`] to completion before taking the next one.
//! Connection tasks only decode frames and post events; history replays run
//! in their own tasks and report back with [`RelayEvent::HistoryFinished`].

use bytes::Bytes;
use futures::future::AbortHandle;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walt_common::{HistoryQuery, RelayConfig, Store};

use crate::filter::RecordFilter;
use crate::hub::{Disposition, LogSink, LogsHub, SinkId, StoreSink};
use crate::listener::StreamListener;
use crate::subscriber::{replay_history, ConnId, HistoryDone, SubscriberHandler};
use crate::wire::{BoxedWriter, SubscribeParams};

/// Events consumed by the dispatcher.
pub enum RelayEvent {
    ProducerConnected {
        conn_id: ConnId,
        peer: SocketAddr,
        reader: AbortHandle,
    },
    ProducerFrame {
        conn_id: ConnId,
        frame: Bytes,
    },
    /// End of stream, or a framing error
    ProducerClosed {
        conn_id: ConnId,
        error: Option<String>,
    },
    SubscriberConnected {
        conn_id: ConnId,
        params: SubscribeParams,
        writer: BoxedWriter,
    },
    HistoryFinished {
        sink_id: SinkId,
        done: HistoryDone,
    },
    Shutdown,
}

/// Serialises all store and hub access for the relay.
pub struct Relay {
    store: Arc<dyn Store>,
    hub: LogsHub,
    producers: HashMap<ConnId, StreamListener>,
    events_tx: mpsc::Sender<RelayEvent>,
    events_rx: mpsc::Receiver<RelayEvent>,
    history_batch_size: usize,
}

impl Relay {
    pub fn new(store: Arc<dyn Store>, config: &RelayConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_depth);
        Self {
            hub: LogsHub::new(StoreSink::new(store.clone())),
            store,
            producers: HashMap::new(),
            events_tx,
            events_rx,
            history_batch_size: config.history_batch_size,
        }
    }

    /// Handle for posting events to this dispatcher.
    pub fn sender(&self) -> mpsc::Sender<RelayEvent> {
        self.events_tx.clone()
    }

    pub fn hub(&self) -> &LogsHub {
        &self.hub
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    /// Process events until [`RelayEvent::Shutdown`].
    pub async fn run(mut self) {
        info!("Relay dispatcher started");
        while let Some(event) = self.events_rx.recv().await {
            if !self.handle(event).await {
                break;
            }
        }
        self.shutdown().await;
        info!("Relay dispatcher stopped");
    }

    /// Wait for the next event.
    pub async fn next_event(&mut self) -> Option<RelayEvent> {
        self.events_rx.recv().await
    }

    /// Handle one event. Returns false once shutdown was requested.
    pub async fn handle(&mut self, event: RelayEvent) -> bool {
        match event {
            RelayEvent::ProducerConnected {
                conn_id,
                peer,
                reader,
            } => {
                debug!(conn_id, %peer, "Producer connected");
                self.producers
                    .insert(conn_id, StreamListener::new(conn_id, peer.ip(), reader));
            }
            RelayEvent::ProducerFrame { conn_id, frame } => {
                let Some(listener) = self.producers.get_mut(&conn_id) else {
                    return true;
                };
                let disposition = listener
                    .on_frame(&frame, self.store.as_ref(), &mut self.hub)
                    .await;
                self.settle_producer(conn_id, disposition);
            }
            RelayEvent::ProducerClosed { conn_id, error } => {
                if let Some(error) = error {
                    warn!(conn_id, %error, "Producer connection failed");
                }
                let disposition = match self.producers.get(&conn_id) {
                    Some(listener) => listener.on_eof(),
                    None => return true,
                };
                self.settle_producer(conn_id, disposition);
            }
            RelayEvent::SubscriberConnected {
                conn_id,
                params,
                writer,
            } => self.subscribe(conn_id, params, writer).await,
            RelayEvent::HistoryFinished { sink_id, done } => {
                if self.hub.finish_history(sink_id, done).await.is_none() {
                    debug!(sink_id, "History finished for a removed subscriber");
                }
            }
            RelayEvent::Shutdown => return false,
        }
        true
    }

    fn settle_producer(&mut self, conn_id: ConnId, disposition: Disposition) {
        if disposition.keeps_registration() {
            return;
        }
        if let Some(listener) = self.producers.remove(&conn_id) {
            if disposition == Disposition::UnregisterAndClose {
                listener.close();
            }
            debug!(conn_id, ?disposition, "Producer removed");
        }
    }

    async fn subscribe(&mut self, conn_id: ConnId, params: SubscribeParams, mut writer: BoxedWriter) {
        let filter = match RecordFilter::from_params(&params) {
            Ok(filter) => filter,
            Err(e) => {
                warn!(conn_id, error = %e, "Rejecting subscription");
                let _ = writer.close().await;
                return;
            }
        };

        let Some((start, end)) = params.history else {
            if params.realtime {
                let sink_id = self
                    .hub
                    .register(Box::new(SubscriberHandler::live(conn_id, filter, writer)));
                info!(conn_id, sink_id, "Live subscriber registered");
            } else {
                debug!(conn_id, "Subscription without history nor realtime");
                let _ = writer.close().await;
            }
            return;
        };

        let watermark = match self.store.last_log_id().await {
            Ok(id) => id,
            Err(e) => {
                warn!(conn_id, error = %e, "Cannot start history replay");
                let _ = writer.close().await;
                return;
            }
        };
        let handler = SubscriberHandler::replaying(conn_id, filter.clone(), params.realtime);
        let sink_id = self.hub.register(Box::new(handler) as Box<dyn LogSink>);
        info!(conn_id, sink_id, watermark, %start, %end, "Replaying history");

        let query = HistoryQuery {
            start,
            end,
            max_id: watermark,
        };
        let store = self.store.clone();
        let events = self.events_tx.clone();
        let batch_size = self.history_batch_size;
        tokio::spawn(async move {
            let done = replay_history(store, query, filter, batch_size, writer).await;
            if events
                .send(RelayEvent::HistoryFinished { sink_id, done })
                .await
                .is_err()
            {
                debug!(sink_id, "Dispatcher gone before history finished");
            }
        });
    }

    async fn shutdown(&mut self) {
        for (_, listener) in self.producers.drain() {
            listener.close();
        }
        self.hub.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{FrameReader, FrameWriter, RelayedRecord};
    use chrono::{DateTime, Duration, Utc};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use tokio::io::DuplexStream;
    use walt_common::{Device, DeviceType, LogRecord, MacAddress, MemoryStore};

    const PRODUCER: ConnId = 1;

    fn t0() -> DateTime<Utc> {
        "2026-03-01T10:00:00Z".parse().unwrap()
    }

    async fn relay() -> (Relay, MemoryStore) {
        let store = MemoryStore::new();
        store
            .upsert_device(&Device {
                mac: MacAddress([0xb8, 0x27, 0xeb, 0, 0, 1]),
                name: "node1".to_string(),
                device_type: DeviceType::node("rpi-3-b"),
                ip: Some("127.0.0.1".parse().unwrap()),
                reachable: true,
            })
            .await
            .unwrap();
        let relay = Relay::new(Arc::new(store.clone()), &RelayConfig::default());
        (relay, store)
    }

    async fn connect_producer(relay: &mut Relay, stream: &str) {
        relay
            .handle(RelayEvent::ProducerConnected {
                conn_id: PRODUCER,
                peer: "127.0.0.1:40000".parse().unwrap(),
                reader: AbortHandle::new_pair().0,
            })
            .await;
        produce(relay, &stream).await;
    }

    async fn produce<T: serde::Serialize>(relay: &mut Relay, value: &T) {
        let frame = Bytes::from(serde_json::to_vec(value).unwrap());
        relay
            .handle(RelayEvent::ProducerFrame {
                conn_id: PRODUCER,
                frame,
            })
            .await;
    }

    async fn produce_lines(relay: &mut Relay, range: std::ops::Range<i64>) {
        for i in range {
            let record = LogRecord::new(t0() + Duration::seconds(i), format!("line {i}"));
            produce(relay, &record).await;
        }
    }

    fn params(history: bool, realtime: bool) -> SubscribeParams {
        SubscribeParams {
            history: history.then(|| (t0(), t0() + Duration::days(1))),
            realtime,
            senders: BTreeSet::from(["node1".to_string()]),
            streams: None,
        }
    }

    async fn subscribe(relay: &mut Relay, params: SubscribeParams) -> FrameReader<DuplexStream> {
        let (server, client) = tokio::io::duplex(1 << 20);
        relay
            .handle(RelayEvent::SubscriberConnected {
                conn_id: 2,
                params,
                writer: FrameWriter::relayed(server, std::time::Duration::from_secs(5)),
            })
            .await;
        FrameReader::new(client, 1 << 16)
    }

    async fn read_lines(reader: &mut FrameReader<DuplexStream>, count: usize) -> Vec<String> {
        let mut lines = Vec::new();
        for _ in 0..count {
            let record: RelayedRecord = reader.read().await.unwrap().unwrap();
            lines.push(record.record.line);
        }
        lines
    }

    #[tokio::test]
    async fn test_history_then_live_without_gap_or_duplicate() {
        let (mut relay, _store) = relay().await;
        connect_producer(&mut relay, "console").await;
        produce_lines(&mut relay, 0..5).await;

        let mut reader = subscribe(&mut relay, params(true, true)).await;
        // logged while the replay is running
        produce_lines(&mut relay, 5..8).await;

        let Some(event) = relay.next_event().await else {
            panic!("dispatcher channel closed");
        };
        assert!(matches!(event, RelayEvent::HistoryFinished { .. }));
        relay.handle(event).await;

        produce_lines(&mut relay, 8..10).await;

        let expected: Vec<String> = (0..10).map(|i| format!("line {i}")).collect();
        assert_eq!(read_lines(&mut reader, 10).await, expected);
        assert_eq!(relay.hub().len(), 1);
    }

    #[tokio::test]
    async fn test_history_only_subscription_ends() {
        let (mut relay, _store) = relay().await;
        connect_producer(&mut relay, "console").await;
        produce_lines(&mut relay, 0..3).await;

        let mut reader = subscribe(&mut relay, params(true, false)).await;
        produce_lines(&mut relay, 3..4).await;
        let event = relay.next_event().await.unwrap();
        relay.handle(event).await;

        assert_eq!(read_lines(&mut reader, 3).await, ["line 0", "line 1", "line 2"]);
        assert!(reader.read::<RelayedRecord>().await.unwrap().is_none());
        assert!(relay.hub().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_without_history_or_realtime_closes() {
        let (mut relay, _store) = relay().await;
        let mut reader = subscribe(&mut relay, params(false, false)).await;
        assert!(reader.read::<RelayedRecord>().await.unwrap().is_none());
        assert!(relay.hub().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_pattern_rejected() {
        let (mut relay, _store) = relay().await;
        let mut bad = params(false, true);
        bad.streams = Some("(".to_string());
        let mut reader = subscribe(&mut relay, bad).await;
        assert!(reader.read::<RelayedRecord>().await.unwrap().is_none());
        assert!(relay.hub().is_empty());
    }

    #[tokio::test]
    async fn test_producer_lifecycle() {
        let (mut relay, store) = relay().await;
        connect_producer(&mut relay, "console").await;
        produce_lines(&mut relay, 0..2).await;
        assert_eq!(store.log_count(), 2);

        relay
            .handle(RelayEvent::ProducerClosed {
                conn_id: PRODUCER,
                error: None,
            })
            .await;
        assert_eq!(relay.producer_count(), 0);

        // frames racing the close are ignored
        produce_lines(&mut relay, 2..3).await;
        assert_eq!(store.log_count(), 2);
    }

    #[tokio::test]
    async fn test_undecodable_frame_drops_producer() {
        let (mut relay, store) = relay().await;
        connect_producer(&mut relay, "console").await;
        produce(&mut relay, &"not a record").await;
        assert_eq!(relay.producer_count(), 0);
        assert_eq!(store.log_count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_subscriber_does_not_block_ingest() {
        let (mut relay, store) = relay().await;
        connect_producer(&mut relay, "console").await;

        // the subscriber end stays open but is never read
        let (server, _client) = tokio::io::duplex(64);
        relay
            .handle(RelayEvent::SubscriberConnected {
                conn_id: 2,
                params: params(false, true),
                writer: FrameWriter::relayed(server, std::time::Duration::from_millis(50)),
            })
            .await;
        assert_eq!(relay.hub().len(), 1);

        let started = std::time::Instant::now();
        produce_lines(&mut relay, 0..3).await;
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert_eq!(store.log_count(), 3);
        assert!(relay.hub().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_handling() {
        let (mut relay, _store) = relay().await;
        assert!(!relay.handle(RelayEvent::Shutdown).await);
    }
}
