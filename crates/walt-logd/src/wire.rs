//! Framed JSON wire format.
//!
//! Every message is one JSON object in a length-delimited frame (4-byte
//! big-endian length prefix). End of stream is the close sentinel.
//!
//! Producer connection:
//!
//! ```text
//! client → server:  "console"                               stream name
//!                   {"timestamp": "...", "line": "..."}     LogRecord, repeated
//!                   <EOF>
//! ```
//!
//! Subscriber connection:
//!
//! ```text
//! client → server:  {"history": [start, end], "realtime": true,
//!                    "senders": ["rpi-4-b-beef"], "streams": "^console$"}
//! server → client:  RelayedRecord, repeated
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use walt_common::StoredRecord;

use crate::error::Result;

/// Record pushed to subscribers: the persisted record with its stream.
pub type RelayedRecord = StoredRecord;

/// Writer half handed between the dispatcher and history tasks.
pub type BoxedWriter = FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>;

fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Reads framed JSON objects.
pub struct FrameReader<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R, max_frame_length: usize) -> Self {
        Self {
            inner: FramedRead::new(io, codec(max_frame_length)),
        }
    }

    /// Next raw frame, `None` on clean end of stream.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        match self.inner.next().await {
            Some(frame) => Ok(Some(frame?.freeze())),
            None => Ok(None),
        }
    }

    /// Next decoded object, `None` on clean end of stream.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.read_frame().await? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

/// Bound on relayed frames, only limited by the 4-byte length prefix.
///
/// A relayed record carries its stream metadata on top of the producer's
/// frame, so it may exceed the producer frame limit.
pub const RELAYED_FRAME_LENGTH: usize = u32::MAX as usize;

/// Writes framed JSON objects.
pub struct FrameWriter<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
    write_timeout: Option<Duration>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W, max_frame_length: usize) -> Self {
        Self {
            inner: FramedWrite::new(io, codec(max_frame_length)),
            write_timeout: None,
        }
    }

    /// Fail writes and closes that take longer than `limit`.
    pub fn with_write_timeout(mut self, limit: Duration) -> Self {
        self.write_timeout = Some(limit);
        self
    }

    /// Encode and flush one object.
    pub async fn write<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        let limit = self.write_timeout;
        bounded(limit, SinkExt::<Bytes>::send(&mut self.inner, Bytes::from(payload))).await?;
        Ok(())
    }

    /// Flush and shut down the write direction.
    pub async fn close(&mut self) -> Result<()> {
        let limit = self.write_timeout;
        bounded(limit, SinkExt::<Bytes>::close(&mut self.inner)).await?;
        Ok(())
    }
}

impl FrameWriter<Box<dyn AsyncWrite + Send + Unpin>> {
    /// Writer for records pushed to a subscriber.
    ///
    /// A peer that stops reading makes writes fail after `write_timeout`.
    pub fn relayed<W>(io: W, write_timeout: Duration) -> BoxedWriter
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let io: Box<dyn AsyncWrite + Send + Unpin> = Box::new(io);
        FrameWriter::new(io, RELAYED_FRAME_LENGTH).with_write_timeout(write_timeout)
    }
}

async fn bounded<F>(limit: Option<Duration>, io: F) -> io::Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, io).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "peer stopped reading",
            )),
        },
        None => io.await,
    }
}

/// First object sent by a subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeParams {
    /// Replay records with timestamps in `[start, end]`
    #[serde(default)]
    pub history: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Keep streaming new records after the replay
    #[serde(default)]
    pub realtime: bool,
    /// Sender names to accept
    #[serde(default)]
    pub senders: BTreeSet<String>,
    /// Regular expression on stream names
    #[serde(default)]
    pub streams: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client, 1024);
        let mut reader = FrameReader::new(server, 1024);

        writer.write("console").await.unwrap();
        let params = SubscribeParams {
            realtime: true,
            senders: ["rpi-4-b-beef".to_string()].into(),
            ..Default::default()
        };
        writer.write(&params).await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(reader.read::<String>().await.unwrap().as_deref(), Some("console"));
        assert_eq!(reader.read::<SubscribeParams>().await.unwrap(), Some(params));
        assert_eq!(reader.read::<String>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_length_prefix_is_big_endian() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 2, b'4', b'2']).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, 1024);
        assert_eq!(reader.read::<u32>().await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_an_error() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 1, 0]).await.unwrap();

        let mut reader = FrameReader::new(server, 16);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_bad_json_is_an_error() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client, 1024);
        writer.write(&42u32).await.unwrap();

        let mut reader = FrameReader::new(server, 1024);
        assert!(reader.read::<SubscribeParams>().await.is_err());
    }

    #[tokio::test]
    async fn test_relayed_writer_is_not_bound_by_producer_limit() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut writer = FrameWriter::relayed(client, Duration::from_secs(5));
        let line = "x".repeat(4096);
        writer.write(&line).await.unwrap();

        let mut reader = FrameReader::new(server, RELAYED_FRAME_LENGTH);
        assert_eq!(reader.read::<String>().await.unwrap(), Some(line));
    }

    #[tokio::test]
    async fn test_write_to_stalled_peer_times_out() {
        // the peer end stays open but is never read
        let (client, _server) = tokio::io::duplex(16);
        let mut writer = FrameWriter::relayed(client, Duration::from_millis(50));

        let err = writer.write(&"y".repeat(256)).await.unwrap_err();
        match err {
            crate::error::RelayError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_subscribe_params_defaults() {
        let params: SubscribeParams = serde_json::from_str(r#"{"senders": ["n1"]}"#).unwrap();
        assert_eq!(params.history, None);
        assert!(!params.realtime);
        assert_eq!(params.streams, None);
    }
}
