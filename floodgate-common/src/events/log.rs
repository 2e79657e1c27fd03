//! Append-only in-memory event log

use super::Event;
use chrono::Utc;
use std::sync::Arc;

/// Ordered events of one stream, ids assigned densely from zero
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<Arc<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `event`, assigning the next id and a timestamp
    ///
    /// Returns `None` (and logs nothing) when the event has no content.
    pub fn add(&mut self, event: Event) -> Option<Arc<Event>> {
        if !event.has_content() {
            return None;
        }
        let id = self.events.len() as u64;
        let logged = Arc::new(event.stamp(id, Utc::now()));
        self.events.push(Arc::clone(&logged));
        Some(logged)
    }

    /// Logged events with `id >= cursor`, in log order
    pub fn replay(&self, cursor: u64) -> impl Iterator<Item = &Arc<Event>> + '_ {
        let start = self
            .events
            .partition_point(|event| event.id().map_or(true, |id| id < cursor));
        self.events[start..].iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last_id(&self) -> Option<u64> {
        self.events.last().and_then(|event| event.id())
    }

    /// Drop every logged event; ids restart from zero
    pub fn clear(&mut self) {
        self.events.clear();
    }
}
