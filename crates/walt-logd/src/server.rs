//! TCP front end of the relay.

use futures::future::{AbortHandle, Abortable};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use walt_common::{RelayConfig, Store};

use crate::dispatcher::{Relay, RelayEvent};
use crate::error::Result;
use crate::subscriber::ConnId;
use crate::wire::{FrameReader, FrameWriter, SubscribeParams};

/// Relay bound to its producer and subscriber ports.
pub struct RelayServer {
    relay: Relay,
    producers: TcpListener,
    subscribers: TcpListener,
    max_frame_length: usize,
    write_timeout: Duration,
}

impl RelayServer {
    pub async fn bind(store: Arc<dyn Store>, config: &RelayConfig) -> Result<Self> {
        let producers = TcpListener::bind(config.producer_listen).await?;
        let subscribers = TcpListener::bind(config.subscriber_listen).await?;
        Ok(Self {
            relay: Relay::new(store, config),
            producers,
            subscribers,
            max_frame_length: config.max_frame_length,
            write_timeout: config.subscriber_write_timeout(),
        })
    }

    /// Bound producer and subscriber addresses.
    pub fn local_addrs(&self) -> Result<(SocketAddr, SocketAddr)> {
        Ok((self.producers.local_addr()?, self.subscribers.local_addr()?))
    }

    /// Serve until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let Self {
            relay,
            producers,
            subscribers,
            max_frame_length,
            write_timeout,
        } = self;
        info!(
            producers = %producers.local_addr()?,
            subscribers = %subscribers.local_addr()?,
            "Log relay listening"
        );

        let events = relay.sender();
        let next_conn_id = Arc::new(AtomicU64::new(1));
        let dispatcher = tokio::spawn(relay.run());
        let producer_loop = tokio::spawn(accept_producers(
            producers,
            events.clone(),
            next_conn_id.clone(),
            max_frame_length,
        ));
        let subscriber_loop = tokio::spawn(accept_subscribers(
            subscribers,
            events.clone(),
            next_conn_id,
            max_frame_length,
            write_timeout,
        ));

        shutdown.await;
        info!("Shutting down log relay");
        producer_loop.abort();
        subscriber_loop.abort();
        if events.send(RelayEvent::Shutdown).await.is_err() {
            warn!("Dispatcher already stopped");
        }
        if let Err(e) = dispatcher.await {
            error!(error = %e, "Dispatcher task failed");
        }
        Ok(())
    }
}

async fn accept_producers(
    listener: TcpListener,
    events: mpsc::Sender<RelayEvent>,
    next_conn_id: Arc<AtomicU64>,
    max_frame_length: usize,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Producer accept failed");
                continue;
            }
        };
        let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (reader, registration) = AbortHandle::new_pair();
        let connected = RelayEvent::ProducerConnected {
            conn_id,
            peer,
            reader,
        };
        if events.send(connected).await.is_err() {
            return;
        }
        let events = events.clone();
        tokio::spawn(Abortable::new(
            read_producer(conn_id, socket, events, max_frame_length),
            registration,
        ));
    }
}

async fn read_producer(
    conn_id: ConnId,
    socket: TcpStream,
    events: mpsc::Sender<RelayEvent>,
    max_frame_length: usize,
) {
    let mut reader = FrameReader::new(socket, max_frame_length);
    let error = loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                if events
                    .send(RelayEvent::ProducerFrame { conn_id, frame })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(None) => break None,
            Err(e) => break Some(e.to_string()),
        }
    };
    let _ = events
        .send(RelayEvent::ProducerClosed { conn_id, error })
        .await;
}

async fn accept_subscribers(
    listener: TcpListener,
    events: mpsc::Sender<RelayEvent>,
    next_conn_id: Arc<AtomicU64>,
    max_frame_length: usize,
    write_timeout: Duration,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Subscriber accept failed");
                continue;
            }
        };
        let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(open_subscription(
            conn_id,
            peer,
            socket,
            events.clone(),
            max_frame_length,
            write_timeout,
        ));
    }
}

async fn open_subscription(
    conn_id: ConnId,
    peer: SocketAddr,
    socket: TcpStream,
    events: mpsc::Sender<RelayEvent>,
    max_frame_length: usize,
    write_timeout: Duration,
) {
    let (read_half, write_half) = socket.into_split();
    let mut reader = FrameReader::new(read_half, max_frame_length);
    let params = match reader.read::<SubscribeParams>().await {
        Ok(Some(params)) => params,
        Ok(None) => {
            debug!(conn_id, %peer, "Subscriber left before subscribing");
            return;
        }
        Err(e) => {
            warn!(conn_id, %peer, error = %e, "Bad subscription request");
            return;
        }
    };
    debug!(conn_id, %peer, ?params, "Subscriber connected");
    let _ = events
        .send(RelayEvent::SubscriberConnected {
            conn_id,
            params,
            writer: FrameWriter::relayed(write_half, write_timeout),
        })
        .await;
}
