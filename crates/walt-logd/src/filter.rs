//! Subscriber record filters.

use regex::Regex;
use std::collections::BTreeSet;
use walt_common::LogStream;

use crate::error::Result;
use crate::wire::SubscribeParams;

/// Decides which records a subscriber receives.
///
/// The same filter runs on replayed and live records, so both paths make
/// identical decisions.
#[derive(Debug, Clone)]
pub struct RecordFilter {
    senders: BTreeSet<String>,
    streams: Option<Regex>,
}

impl RecordFilter {
    pub fn new(senders: BTreeSet<String>, streams: Option<&str>) -> Result<Self> {
        Ok(Self {
            senders,
            streams: streams.map(Regex::new).transpose()?,
        })
    }

    pub fn from_params(params: &SubscribeParams) -> Result<Self> {
        Self::new(params.senders.clone(), params.streams.as_deref())
    }

    /// Returns true if records of `stream` pass this filter.
    ///
    /// Senders are matched by the name the device had when the stream was
    /// created. A device renamed later keeps its existing streams under the
    /// old name; only streams opened after the rename carry the new one.
    /// Streams without a resolved sender never match.
    pub fn accepts(&self, stream: &LogStream) -> bool {
        let Some(sender) = &stream.sender_name else {
            return false;
        };
        self.senders.contains(sender)
            && self
                .streams
                .as_ref()
                .map_or(true, |pattern| pattern.is_match(&stream.name))
    }
}
