//! Subscriber connections: history replay followed by live tailing.
//!
//! A subscriber asking for history is registered in the hub while a
//! separate task streams stored records straight to the client. Live
//! records accepted meanwhile are buffered. Once the task hands the writer
//! back, the buffer is flushed in arrival order and the subscriber goes live.
//!
//! ```text
//!            register (watermark = last record id)
//!                 │
//!   Replaying ────┴── HistoryDone ──▶ flush buffer ──▶ Live
//!   (buffering)            │
//!                          └── realtime = false ──▶ closed
//! ```

use async_trait::async_trait;
use futures::TryStreamExt;
use std::sync::Arc;
use tracing::{debug, warn};
use walt_common::{HistoryQuery, Store};

use crate::error::{RelayError, Result};
use crate::filter::RecordFilter;
use crate::hub::{Disposition, LogSink};
use crate::wire::{BoxedWriter, RelayedRecord};

/// Connection identifier assigned by the server
pub type ConnId = u64;

/// Outcome of a history replay, carrying the writer back.
pub struct HistoryDone {
    pub writer: BoxedWriter,
    /// Number of records sent
    pub result: Result<usize>,
}

enum SubscriberState {
    Replaying { buffer: Vec<RelayedRecord> },
    Live { writer: BoxedWriter },
}

/// Hub sink of one subscriber connection.
pub struct SubscriberHandler {
    conn_id: ConnId,
    filter: RecordFilter,
    realtime: bool,
    state: SubscriberState,
}

impl SubscriberHandler {
    /// Subscriber receiving live records right away.
    pub fn live(conn_id: ConnId, filter: RecordFilter, writer: BoxedWriter) -> Self {
        Self {
            conn_id,
            filter,
            realtime: true,
            state: SubscriberState::Live { writer },
        }
    }

    /// Subscriber waiting for its history replay.
    pub fn replaying(conn_id: ConnId, filter: RecordFilter, realtime: bool) -> Self {
        Self {
            conn_id,
            filter,
            realtime,
            state: SubscriberState::Replaying { buffer: Vec::new() },
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, SubscriberState::Live { .. })
    }
}

#[async_trait]
impl LogSink for SubscriberHandler {
    fn describe(&self) -> String {
        format!("subscriber #{}", self.conn_id)
    }

    async fn deliver(&mut self, record: &RelayedRecord) -> Disposition {
        if !self.filter.accepts(&record.stream) {
            return Disposition::Continue;
        }
        match &mut self.state {
            SubscriberState::Replaying { buffer } => {
                if self.realtime {
                    buffer.push(record.clone());
                }
                Disposition::Continue
            }
            SubscriberState::Live { writer } => match writer.write(record).await {
                Ok(()) => Disposition::Continue,
                Err(e) => {
                    debug!(conn_id = self.conn_id, error = %e, "Subscriber gone");
                    Disposition::Unregister
                }
            },
        }
    }

    async fn on_history(&mut self, done: HistoryDone) -> Disposition {
        let HistoryDone { mut writer, result } = done;
        match result {
            Ok(count) => debug!(conn_id = self.conn_id, count, "History replay done"),
            Err(RelayError::Io(e)) => {
                debug!(conn_id = self.conn_id, error = %e, "Subscriber gone during replay");
                return Disposition::Unregister;
            }
            Err(e) => {
                warn!(conn_id = self.conn_id, error = %e, "History replay failed");
                let _ = writer.close().await;
                return Disposition::UnregisterAndClose;
            }
        }

        if !self.realtime {
            let _ = writer.close().await;
            return Disposition::UnregisterAndClose;
        }

        let buffered = match &mut self.state {
            SubscriberState::Replaying { buffer } => std::mem::take(buffer),
            SubscriberState::Live { .. } => Vec::new(),
        };
        for record in &buffered {
            if writer.write(record).await.is_err() {
                return Disposition::Unregister;
            }
        }
        debug!(conn_id = self.conn_id, flushed = buffered.len(), "Subscriber live");
        self.state = SubscriberState::Live { writer };
        Disposition::Continue
    }

    async fn close(&mut self) {
        if let SubscriberState::Live { writer } = &mut self.state {
            let _ = writer.close().await;
        }
    }
}

/// Stream stored records matching `query` and `filter` to `writer`.
pub async fn replay_history(
    store: Arc<dyn Store>,
    query: HistoryQuery,
    filter: RecordFilter,
    batch_size: usize,
    mut writer: BoxedWriter,
) -> HistoryDone {
    let result = async {
        let mut cursor = store.scan_logs(query, batch_size);
        let mut sent = 0usize;
        while let Some(record) = cursor.try_next().await? {
            if filter.accepts(&record.stream) {
                writer.write(&record).await?;
                sent += 1;
            }
        }
        Ok::<_, RelayError>(sent)
    }
    .await;
    HistoryDone { writer, result }
}
