//! Producer connections.

use futures::future::AbortHandle;
use std::net::IpAddr;
use tracing::{error, info, warn};
use walt_common::{LogRecord, LogStream, Store};

use crate::error::{RelayError, Result};
use crate::hub::{Disposition, LogsHub};
use crate::subscriber::ConnId;

/// Dispatcher-side state of one producer connection.
///
/// The first frame names the stream; every later frame is a [`LogRecord`].
pub struct StreamListener {
    conn_id: ConnId,
    peer: IpAddr,
    stream: Option<LogStream>,
    reader: AbortHandle,
}

impl StreamListener {
    pub fn new(conn_id: ConnId, peer: IpAddr, reader: AbortHandle) -> Self {
        Self {
            conn_id,
            peer: peer.to_canonical(),
            stream: None,
            reader,
        }
    }

    pub fn stream(&self) -> Option<&LogStream> {
        self.stream.as_ref()
    }

    /// Handle one frame read from the producer.
    pub async fn on_frame(
        &mut self,
        frame: &[u8],
        store: &dyn Store,
        hub: &mut LogsHub,
    ) -> Disposition {
        let Some(stream) = &self.stream else {
            return match self.open_stream(frame, store).await {
                Ok(stream) => {
                    info!(
                        conn_id = self.conn_id,
                        peer = %self.peer,
                        stream = %stream.name,
                        sender = stream.sender_name.as_deref().unwrap_or("-"),
                        "Log stream opened"
                    );
                    self.stream = Some(stream);
                    Disposition::Continue
                }
                Err(e) => {
                    warn!(conn_id = self.conn_id, peer = %self.peer, error = %e, "Rejecting producer");
                    Disposition::UnregisterAndClose
                }
            };
        };

        let record: LogRecord = match serde_json::from_slice(frame) {
            Ok(record) => record,
            Err(e) => {
                warn!(conn_id = self.conn_id, error = %e, "Undecodable log record");
                return Disposition::UnregisterAndClose;
            }
        };
        if let Err(e) = hub.log(stream, record).await {
            error!(conn_id = self.conn_id, stream = %stream.name, error = %e, "Dropping log record");
        }
        Disposition::Continue
    }

    /// The producer closed its connection.
    pub fn on_eof(&self) -> Disposition {
        Disposition::Unregister
    }

    /// Stop reading from the producer.
    pub fn close(&self) {
        self.reader.abort();
    }

    async fn open_stream(&self, frame: &[u8], store: &dyn Store) -> Result<LogStream> {
        let name: String = serde_json::from_slice(frame)?;
        if name.is_empty() {
            return Err(RelayError::Protocol("empty stream name".to_string()));
        }

        let sender = store.device_by_ip(self.peer).await?;
        let sender_mac = sender.as_ref().map(|d| d.mac);
        if let Some(stream) = store.find_stream(sender_mac, &name).await? {
            return Ok(stream);
        }
        Ok(store
            .insert_stream(sender_mac, sender.map(|d| d.name), &name)
            .await?)
    }
}
