//! Sliding-window admission control
//!
//! Two tiers: every socket gets a [`SlidingWindow`] per traffic class, and
//! bursts it cannot absorb are delegated to the remote IP's
//! [`SharedSlidingWindow`], which splits its budget fairly between sockets.

mod shared;
mod sliding;

pub use shared::SharedSlidingWindow;
pub use sliding::SlidingWindow;

use crate::request::RequestRecord;
use std::sync::{Mutex, MutexGuard};

// Poisoning is ignored: a slot array is valid after any partial update.
fn lock_slots(slots: &Mutex<Vec<Option<RequestRecord>>>) -> MutexGuard<'_, Vec<Option<RequestRecord>>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
