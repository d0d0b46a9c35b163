//! WALT log relay hub.
//!
//! Nodes stream log lines to the relay, which persists each record and
//! fans it out to subscribers. A subscriber may ask for a replay of stored
//! records first and then keep receiving live ones.
//!
//! ```text
//!  producer ─┐                          ┌─▶ store
//!  producer ─┼─▶ events ─▶ Relay ─▶ hub ┼─▶ subscriber (live)
//!  producer ─┘               │          └─▶ subscriber (replaying, buffered)
//!                            └─▶ history task ─▶ subscriber socket
//! ```
//!
//! All store writes and hub mutations happen on the dispatcher task, one
//! event at a time.

pub mod checkpoint;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod hub;
pub mod listener;
pub mod server;
pub mod subscriber;
pub mod wire;

pub use checkpoint::{format_timestamp, CheckpointBook};
pub use dispatcher::{Relay, RelayEvent};
pub use error::{RelayError, Result};
pub use filter::RecordFilter;
pub use hub::{Disposition, LogSink, LogsHub, SinkId, StoreSink};
pub use listener::StreamListener;
pub use server::RelayServer;
pub use subscriber::{replay_history, ConnId, HistoryDone, SubscriberHandler};
pub use wire::{
    BoxedWriter, FrameReader, FrameWriter, RelayedRecord, SubscribeParams, RELAYED_FRAME_LENGTH,
};
