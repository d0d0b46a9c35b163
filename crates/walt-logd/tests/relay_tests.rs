//! End-to-end relay tests over TCP with the in-memory store.

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use walt_common::{Device, DeviceType, LogRecord, MacAddress, MemoryStore, RelayConfig, Store};
use walt_logd::client;
use walt_logd::{FrameReader, FrameWriter, RelayServer, RelayedRecord, SubscribeParams};

const MAX_FRAME: usize = 64 * 1024;

struct TestRelay {
    store: MemoryStore,
    producers: SocketAddr,
    subscribers: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<walt_logd::Result<()>>,
}

impl TestRelay {
    async fn start() -> Self {
        Self::start_with(MAX_FRAME).await
    }

    async fn start_with(max_frame_length: usize) -> Self {
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

        let config = RelayConfig {
            producer_listen: "127.0.0.1:0".parse().unwrap(),
            subscriber_listen: "127.0.0.1:0".parse().unwrap(),
            history_batch_size: 3,
            max_frame_length,
            ..RelayConfig::default()
        };
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let server = RelayServer::bind(shared, &config).await.unwrap();
        let (producers, subscribers) = server.local_addrs().unwrap();
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(server.run(async {
            let _ = stopped.await;
        }));
        Self {
            store,
            producers,
            subscribers,
            stop: Some(stop),
            task,
        }
    }

    async fn send(&self, stream: &str, lines: &[&str]) {
        let input = Cursor::new(lines.join("\n").into_bytes());
        let sent = client::send(self.producers, stream, input, MAX_FRAME)
            .await
            .unwrap();
        assert_eq!(sent, lines.len());
    }

    async fn wait_for_records(&self, count: usize) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while self.store.log_count() < count {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("records not persisted in time");
    }

    async fn subscribe(&self, params: &SubscribeParams) -> FrameReader<TcpStream> {
        let mut socket = TcpStream::connect(self.subscribers).await.unwrap();
        FrameWriter::new(&mut socket, MAX_FRAME)
            .write(params)
            .await
            .unwrap();
        FrameReader::new(socket, MAX_FRAME)
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

fn params(realtime: bool, streams: Option<&str>) -> SubscribeParams {
    let now = Utc::now();
    SubscribeParams {
        history: Some((now - Duration::hours(1), now + Duration::hours(1))),
        realtime,
        senders: BTreeSet::from(["node1".to_string()]),
        streams: streams.map(str::to_string),
    }
}

async fn read_lines(reader: &mut FrameReader<TcpStream>, count: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for _ in 0..count {
        let record = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            reader.read::<RelayedRecord>(),
        )
        .await
        .expect("record not received in time")
        .unwrap()
        .expect("relay closed the subscription");
        lines.push(record.record.line);
    }
    lines
}

#[tokio::test]
async fn test_history_then_live_over_tcp() {
    let relay = TestRelay::start().await;
    relay.send("console", &["h0", "h1", "h2", "h3", "h4"]).await;
    relay.wait_for_records(5).await;

    let mut reader = relay.subscribe(&params(true, None)).await;
    relay.send("console", &["l0", "l1", "l2"]).await;

    assert_eq!(
        read_lines(&mut reader, 8).await,
        ["h0", "h1", "h2", "h3", "h4", "l0", "l1", "l2"]
    );
    relay.stop().await;
}

#[tokio::test]
async fn test_history_only_subscription_is_closed() {
    let relay = TestRelay::start().await;
    relay.send("console", &["a", "b"]).await;
    relay.wait_for_records(2).await;

    let mut reader = relay.subscribe(&params(false, None)).await;
    assert_eq!(read_lines(&mut reader, 2).await, ["a", "b"]);
    assert!(reader.read::<RelayedRecord>().await.unwrap().is_none());
    relay.stop().await;
}

#[tokio::test]
async fn test_stream_filter_applies_to_history_and_live() {
    let relay = TestRelay::start().await;
    relay.send("console", &["c0"]).await;
    relay.send("kernel", &["k0"]).await;
    relay.wait_for_records(2).await;

    let mut reader = relay.subscribe(&params(true, Some("^console$"))).await;
    relay.send("kernel", &["k1"]).await;
    relay.send("console", &["c1"]).await;

    assert_eq!(read_lines(&mut reader, 2).await, ["c0", "c1"]);
    relay.stop().await;
}

#[tokio::test]
async fn test_tail_client_collects_history() {
    let relay = TestRelay::start().await;
    relay.send("console", &["x", "y", "z"]).await;
    relay.wait_for_records(3).await;

    let mut lines = Vec::new();
    let received = client::tail(relay.subscribers, &params(false, None), MAX_FRAME, |record| {
        lines.push(client::format_record(&record))
    })
    .await
    .unwrap();

    assert_eq!(received, 3);
    assert!(lines[0].ends_with("node1.console -> x"));
    assert!(lines[2].ends_with("node1.console -> z"));
    relay.stop().await;
}

#[tokio::test]
async fn test_other_sender_subscription_gets_nothing() {
    let relay = TestRelay::start().await;
    relay.send("console", &["not for node2"]).await;
    relay.wait_for_records(1).await;

    let mut other = params(false, None);
    other.senders = BTreeSet::from(["node2".to_string()]);
    let mut reader = relay.subscribe(&other).await;
    assert!(reader.read::<RelayedRecord>().await.unwrap().is_none());
    relay.stop().await;
}

#[tokio::test]
async fn test_record_near_frame_limit_reaches_subscriber() {
    const LIMIT: usize = 256;
    let relay = TestRelay::start_with(LIMIT).await;
    let mut reader = relay.subscribe(&params(true, None)).await;

    let long = "x".repeat(180);
    let widest_timestamp = "2026-03-01T10:00:00.123456789Z".parse().unwrap();
    let frame = serde_json::to_vec(&LogRecord::new(widest_timestamp, long.as_str())).unwrap();
    assert!(frame.len() < LIMIT);

    relay.send("console", &[long.as_str(), "small"]).await;
    assert_eq!(read_lines(&mut reader, 2).await, [long.as_str(), "small"]);
    relay.stop().await;
}
