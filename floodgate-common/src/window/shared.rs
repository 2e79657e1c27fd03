//! Sliding window shared by every socket of one remote IP

use super::sliding::{Placement, SlidingWindow};
use super::lock_slots;
use crate::config::WindowConfig;
use crate::request::RequestRecord;
use std::collections::HashSet;
use std::net::SocketAddr;

/// A [`SlidingWindow`] that also enforces a per-socket fair share
///
/// A lone socket may take strictly less than half of the capacity; once
/// several sockets are active each one is held to `capacity / sockets`.
#[derive(Debug)]
pub struct SharedSlidingWindow {
    window: SlidingWindow,
}

impl SharedSlidingWindow {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            window: SlidingWindow::new(config),
        }
    }

    pub fn capacity(&self) -> usize {
        self.window.capacity()
    }

    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }

    /// Admit `record` iff its socket is within its fair share and the
    /// wrapped window admits it. Rejected-by-fairness requests are not
    /// recorded.
    pub fn allow_request(&self, record: &RequestRecord) -> bool {
        let mut slots = lock_slots(&self.window.slots);

        if !self.is_fair(&slots, record) {
            return false;
        }
        self.window.place(&mut slots, record) == Placement::Admitted
    }

    fn is_fair(&self, slots: &[Option<RequestRecord>], record: &RequestRecord) -> bool {
        let now = record.creation_time;
        let duration = self.window.duration();

        let mut sockets: HashSet<SocketAddr> = HashSet::new();
        sockets.insert(record.remote_addr);
        let mut prior_count = 0usize;

        for tracked in slots.iter().flatten() {
            if now.saturating_duration_since(tracked.creation_time) >= duration {
                continue;
            }
            sockets.insert(tracked.remote_addr);
            if tracked.remote_addr == record.remote_addr {
                prior_count += 1;
            }
        }

        let total_capacity = slots.len() as f64;
        let requested = (prior_count + 1) as f64;

        if sockets.len() == 1 {
            requested < total_capacity * 0.5
        } else {
            requested <= total_capacity / sockets.len() as f64
        }
    }
}
