//! Broadcastable events and the per-stream event log
//!
//! An [`Event`] is built by a producer, handed to a stream, and becomes
//! immutable once the stream's [`EventLog`] has assigned it an id and a
//! timestamp. Subscribers share logged events through `Arc<Event>`.

mod log;

pub use log::EventLog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One server-sent event
///
/// # Examples
///
/// ```
/// use floodgate_common::events::Event;
///
/// let event = Event::new("queue updated")
///     .with_event_name("queue")
///     .with_retry(3_000);
/// assert!(event.has_content());
/// assert!(!Event::default().has_content());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: Option<u64>,
    data: String,
    event_name: String,
    retry: Option<u64>,
    comment: String,
    timestamp: Option<DateTime<Utc>>,
    #[serde(skip)]
    end_of_stream: bool,
}

impl Event {
    /// Event carrying `data`
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Comment-only event, written as `: <comment>`
    pub fn comment(comment: impl Into<String>) -> Self {
        Self {
            comment: comment.into(),
            ..Self::default()
        }
    }

    /// Sentinel telling push handlers the producer is done
    ///
    /// Sentinels are fanned out to current subscribers but never logged,
    /// so they are not replayed.
    pub fn end_of_stream() -> Self {
        Self {
            end_of_stream: true,
            ..Self::default()
        }
    }

    pub fn with_event_name(mut self, name: impl Into<String>) -> Self {
        self.event_name = name.into();
        self
    }

    /// Reconnection delay hint in milliseconds
    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Id assigned by the event log; `None` until logged
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn retry(&self) -> Option<u64> {
        self.retry
    }

    pub fn comment_text(&self) -> &str {
        &self.comment
    }

    /// Creation time assigned by the event log
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// At least one of data, event name, retry or comment is set
    pub fn has_content(&self) -> bool {
        !self.data.is_empty()
            || !self.event_name.is_empty()
            || self.retry.is_some()
            || !self.comment.is_empty()
    }

    pub(crate) fn stamp(mut self, id: u64, timestamp: DateTime<Utc>) -> Self {
        self.id = Some(id);
        self.timestamp = Some(timestamp);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_content_per_field() {
        assert!(Event::new("x").has_content());
        assert!(Event::default().with_event_name("tick").has_content());
        assert!(Event::default().with_retry(10).has_content());
        assert!(Event::comment("hb").has_content());
        assert!(!Event::default().has_content());
        assert!(!Event::end_of_stream().has_content());
    }

    #[test]
    fn test_unlogged_event_has_no_id() {
        let event = Event::new("x");
        assert_eq!(event.id(), None);
        assert_eq!(event.timestamp(), None);
    }
}
