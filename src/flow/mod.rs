//! flow/mod.rs
//!
//! The hand-off between the acquisition side of the relay and the
//! consumption cycle.
//!
//! `SampleBus` is a single slot guarded by a mutex. Writers replace whatever
//! is in the slot; the reader takes it. A reading that was never taken is
//! simply overwritten by the next one, so the consumer always sees the
//! newest value and never a backlog.

use std::sync::{Mutex, PoisonError};

use crate::types::HeartRateSample;

/// Latest-value-wins slot shared by one writer side and one reader.
#[derive(Debug, Default)]
pub struct SampleBus {
    slot: Mutex<Option<HeartRateSample>>,
}

impl SampleBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a reading, replacing any unread one.
    pub fn publish(&self, sample: HeartRateSample) {
        let previous = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(sample);
        if let Some(previous) = previous {
            log::trace!("Unread reading {} overwritten", previous);
        }
    }

    /// Drain the slot, returning the newest unread reading.
    pub fn take(&self) -> Option<HeartRateSample> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Drop any unread reading (used when the active source changes).
    pub fn clear(&self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}
