//! Log broadcast hub.
//!
//! Every record entering the hub is first persisted by the [`StoreSink`],
//! which assigns its id, then delivered to the registered sinks in
//! registration order. Sinks report their fate through [`Disposition`];
//! sinks that ask to leave are removed right after the broadcast.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};
use walt_common::{LogRecord, LogStream, Store};

use crate::error::Result;
use crate::subscriber::HistoryDone;
use crate::wire::RelayedRecord;

/// Identifier of a registered sink
pub type SinkId = u64;

/// What the hub does with a sink after an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the sink registered
    Continue,
    /// Remove the sink, its peer is already gone
    Unregister,
    /// Remove the sink and call [`LogSink::close`]
    UnregisterAndClose,
}

impl Disposition {
    pub fn keeps_registration(self) -> bool {
        self == Disposition::Continue
    }
}

/// Receiver of relayed records.
#[async_trait]
pub trait LogSink: Send {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Deliver one record.
    async fn deliver(&mut self, record: &RelayedRecord) -> Disposition;

    /// Take back the result of a history replay started for this sink.
    async fn on_history(&mut self, done: HistoryDone) -> Disposition {
        let _ = done;
        Disposition::UnregisterAndClose
    }

    /// Release the sink's resources.
    async fn close(&mut self) {}
}

/// Persists every record before it is broadcast.
#[derive(Clone)]
pub struct StoreSink {
    store: Arc<dyn Store>,
}

impl StoreSink {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Persist a record, assigning its id.
    pub async fn persist(&self, stream: &LogStream, record: LogRecord) -> Result<RelayedRecord> {
        Ok(self.store.append_log(stream, record).await?)
    }
}

/// Registry of sinks fed by the dispatcher.
pub struct LogsHub {
    store: StoreSink,
    sinks: Vec<(SinkId, Box<dyn LogSink>)>,
    next_id: SinkId,
}

impl LogsHub {
    pub fn new(store: StoreSink) -> Self {
        Self {
            store,
            sinks: Vec::new(),
            next_id: 1,
        }
    }

    /// Register a sink behind the ones already present.
    pub fn register(&mut self, sink: Box<dyn LogSink>) -> SinkId {
        let id = self.next_id;
        self.next_id += 1;
        debug!(sink_id = id, sink = %sink.describe(), "Registered sink");
        self.sinks.push((id, sink));
        id
    }

    /// Remove a sink without closing it.
    pub fn unregister(&mut self, id: SinkId) -> Option<Box<dyn LogSink>> {
        let position = self.sinks.iter().position(|(sink_id, _)| *sink_id == id)?;
        Some(self.sinks.remove(position).1)
    }

    /// Number of registered sinks, not counting the store.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn contains(&self, id: SinkId) -> bool {
        self.sinks.iter().any(|(sink_id, _)| *sink_id == id)
    }

    /// Persist a record and broadcast it.
    ///
    /// Nothing is broadcast when persisting fails.
    #[instrument(skip_all, fields(stream = %stream.name))]
    pub async fn log(&mut self, stream: &LogStream, record: LogRecord) -> Result<RelayedRecord> {
        let record = self.store.persist(stream, record).await?;

        let mut leaving = Vec::new();
        for (id, sink) in self.sinks.iter_mut() {
            let disposition = sink.deliver(&record).await;
            if !disposition.keeps_registration() {
                leaving.push((*id, disposition));
            }
        }
        for (id, disposition) in leaving {
            self.dismiss(id, disposition).await;
        }
        Ok(record)
    }

    /// Hand a finished history replay back to its sink.
    ///
    /// Returns `None` if the sink is no longer registered.
    pub async fn finish_history(&mut self, id: SinkId, done: HistoryDone) -> Option<Disposition> {
        let (_, sink) = self.sinks.iter_mut().find(|(sink_id, _)| *sink_id == id)?;
        let disposition = sink.on_history(done).await;
        if !disposition.keeps_registration() {
            self.dismiss(id, disposition).await;
        }
        Some(disposition)
    }

    /// Close and remove every sink.
    pub async fn close_all(&mut self) {
        for (_, mut sink) in self.sinks.drain(..) {
            sink.close().await;
        }
    }

    async fn dismiss(&mut self, id: SinkId, disposition: Disposition) {
        if let Some(mut sink) = self.unregister(id) {
            debug!(sink_id = id, sink = %sink.describe(), ?disposition, "Removing sink");
            if disposition == Disposition::UnregisterAndClose {
                sink.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use walt_common::MemoryStore;

    /// Records deliveries and answers with a scripted disposition.
    struct ProbeSink {
        label: &'static str,
        journal: Arc<Mutex<Vec<String>>>,
        answer: Disposition,
    }

    #[async_trait]
    impl LogSink for ProbeSink {
        fn describe(&self) -> String {
            self.label.to_string()
        }

        async fn deliver(&mut self, record: &RelayedRecord) -> Disposition {
            self.journal
                .lock()
                .push(format!("{}:{}", self.label, record.id));
            self.answer
        }

        async fn close(&mut self) {
            self.journal.lock().push(format!("{}:closed", self.label));
        }
    }

    fn stream() -> LogStream {
        LogStream {
            id: 1,
            sender_mac: None,
            sender_name: Some("node1".to_string()),
            name: "console".to_string(),
        }
    }

    fn recording_sink(
        label: &'static str,
        journal: &Arc<Mutex<Vec<String>>>,
        answer: Disposition,
    ) -> Box<dyn LogSink> {
        Box::new(ProbeSink {
            label,
            journal: journal.clone(),
            answer,
        })
    }

    #[tokio::test]
    async fn test_persist_before_broadcast() {
        let store = MemoryStore::new();
        let mut hub = LogsHub::new(StoreSink::new(Arc::new(store.clone())));
        let journal = Arc::new(Mutex::new(Vec::new()));
        hub.register(recording_sink("a", &journal, Disposition::Continue));

        let record = hub
            .log(&stream(), LogRecord::new(Utc::now(), "hello"))
            .await
            .unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(store.log_count(), 1);
        assert_eq!(*journal.lock(), vec!["a:1"]);
    }

    #[tokio::test]
    async fn test_removal_by_disposition() {
        let mut hub = LogsHub::new(StoreSink::new(Arc::new(MemoryStore::new())));
        let journal = Arc::new(Mutex::new(Vec::new()));
        let a = hub.register(recording_sink("a", &journal, Disposition::Continue));
        let b = hub.register(recording_sink("b", &journal, Disposition::Unregister));
        let c = hub.register(recording_sink("c", &journal, Disposition::UnregisterAndClose));
        assert_eq!(hub.len(), 3);

        hub.log(&stream(), LogRecord::new(Utc::now(), "one"))
            .await
            .unwrap();
        assert!(hub.contains(a));
        assert!(!hub.contains(b));
        assert!(!hub.contains(c));

        hub.log(&stream(), LogRecord::new(Utc::now(), "two"))
            .await
            .unwrap();
        assert_eq!(
            *journal.lock(),
            vec!["a:1", "b:1", "c:1", "c:closed", "a:2"]
        );
    }

    #[tokio::test]
    async fn test_unregister_does_not_close() {
        let mut hub = LogsHub::new(StoreSink::new(Arc::new(MemoryStore::new())));
        let journal = Arc::new(Mutex::new(Vec::new()));
        let a = hub.register(recording_sink("a", &journal, Disposition::Continue));

        assert!(hub.unregister(a).is_some());
        assert!(hub.unregister(a).is_none());
        assert!(hub.is_empty());
        assert!(journal.lock().is_empty());
    }
}
