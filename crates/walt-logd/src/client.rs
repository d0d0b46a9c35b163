//! Producer and subscriber clients.

use chrono::{SecondsFormat, Utc};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::net::TcpStream;
use tracing::debug;
use walt_common::LogRecord;

use crate::error::Result;
use crate::wire::{
    FrameReader, FrameWriter, RelayedRecord, SubscribeParams, RELAYED_FRAME_LENGTH,
};

/// Address to dial for a listen address, mapping wildcards to loopback.
pub fn dial_addr(listen: SocketAddr) -> SocketAddr {
    let ip = match listen.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, listen.port())
}

/// Subscribe and hand every received record to `on_record`.
///
/// `max_frame_length` bounds the subscription request only.
/// Returns the number of records received once the relay closes the
/// connection.
pub async fn tail<F>(
    addr: SocketAddr,
    params: &SubscribeParams,
    max_frame_length: usize,
    mut on_record: F,
) -> Result<usize>
where
    F: FnMut(RelayedRecord),
{
    let socket = TcpStream::connect(addr).await?;
    let (read_half, write_half) = socket.into_split();
    let mut writer = FrameWriter::new(write_half, max_frame_length);
    writer.write(params).await?;

    let mut reader = FrameReader::new(read_half, RELAYED_FRAME_LENGTH);
    let mut received = 0;
    while let Some(record) = reader.read::<RelayedRecord>().await? {
        on_record(record);
        received += 1;
    }
    debug!(%addr, received, "Subscription ended");
    Ok(received)
}

/// Forward each line of `input` to the relay as a record of `stream`.
pub async fn send<R>(addr: SocketAddr, stream: &str, input: R, max_frame_length: usize) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let socket = TcpStream::connect(addr).await?;
    let mut writer = FrameWriter::new(socket, max_frame_length);
    writer.write(stream).await?;

    let mut lines = input.lines();
    let mut sent = 0;
    while let Some(line) = lines.next_line().await? {
        writer.write(&LogRecord::new(Utc::now(), line)).await?;
        sent += 1;
    }
    writer.close().await?;
    debug!(%addr, stream, sent, "Producer done");
    Ok(sent)
}

/// One display line per record.
pub fn format_record(record: &RelayedRecord) -> String {
    format!(
        "{} {}.{} -> {}",
        record
            .record
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        record.stream.sender_name.as_deref().unwrap_or("?"),
        record.stream.name,
        record.record.line
    )
}
