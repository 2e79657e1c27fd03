//! Fixed-capacity sliding window

use super::{lock_slots, SharedSlidingWindow};
use crate::config::WindowConfig;
use crate::request::RequestRecord;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outcome of placing a record into the slot array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Placement {
    Admitted,
    /// The slot array is saturated with young records; the caller decides
    /// (the parent window, if any, gets the final word).
    Burst,
}

/// Admission window over a fixed array of request slots
///
/// The slots are a working set rather than a log: when every slot is taken,
/// an expired slot (or, failing that, the oldest one) is recycled. Memory per
/// window therefore never grows past `capacity` records.
pub struct SlidingWindow {
    duration: Duration,
    pub(super) slots: Mutex<Vec<Option<RequestRecord>>>,
    parent: Option<Arc<SharedSlidingWindow>>,
}

impl SlidingWindow {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            duration: config.duration(),
            slots: Mutex::new(vec![None; config.capacity.max(1)]),
            parent: None,
        }
    }

    /// Window whose bursts are delegated to an IP-level shared window
    pub fn with_parent(config: WindowConfig, parent: Arc<SharedSlidingWindow>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new(config)
        }
    }

    pub fn capacity(&self) -> usize {
        lock_slots(&self.slots).len()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn parent(&self) -> Option<&Arc<SharedSlidingWindow>> {
        self.parent.as_ref()
    }

    /// Number of occupied slots, expired or not
    pub fn occupied(&self) -> usize {
        lock_slots(&self.slots).iter().flatten().count()
    }

    /// Number of records still inside the window at `now`
    pub fn tracked_at(&self, now: Instant) -> usize {
        lock_slots(&self.slots)
            .iter()
            .flatten()
            .filter(|r| now.saturating_duration_since(r.creation_time) < self.duration)
            .count()
    }

    /// Decide whether `record` is admitted, recording it in the window
    pub fn allow_request(&self, record: &RequestRecord) -> bool {
        let placement = {
            let mut slots = lock_slots(&self.slots);
            self.place(&mut slots, record)
        };

        match placement {
            Placement::Admitted => true,
            Placement::Burst => match &self.parent {
                Some(parent) => parent.allow_request(record),
                None => false,
            },
        }
    }

    /// Slot selection; the caller holds the slot lock.
    pub(super) fn place(
        &self,
        slots: &mut [Option<RequestRecord>],
        record: &RequestRecord,
    ) -> Placement {
        if let Some(empty) = slots.iter_mut().find(|slot| slot.is_none()) {
            *empty = Some(record.clone());
            return Placement::Admitted;
        }

        let now = record.creation_time;
        let mut oldest: Option<(usize, Instant)> = None;
        let mut oldest_candidate: Option<(usize, Instant)> = None;
        let mut candidate_count = 0usize;

        for (index, slot) in slots.iter().enumerate() {
            let Some(tracked) = slot else { continue };
            let created = tracked.creation_time;

            if oldest.map_or(true, |(_, t)| created < t) {
                oldest = Some((index, created));
            }
            if now.saturating_duration_since(created) >= self.duration {
                candidate_count += 1;
                if oldest_candidate.map_or(true, |(_, t)| created < t) {
                    oldest_candidate = Some((index, created));
                }
            }
        }

        match (candidate_count, oldest_candidate, oldest) {
            (0, _, Some((index, created))) => {
                slots[index] = Some(record.clone());
                if now.saturating_duration_since(created) < self.duration / 2 {
                    Placement::Burst
                } else {
                    Placement::Admitted
                }
            }
            // one or more expired slots: recycle the oldest of them
            (_, Some((index, _)), _) => {
                slots[index] = Some(record.clone());
                Placement::Admitted
            }
            // unreachable with a non-empty, fully occupied slot array
            _ => Placement::Admitted,
        }
    }
}

impl std::fmt::Debug for SlidingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindow")
            .field("duration", &self.duration)
            .field("occupied", &self.occupied())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
