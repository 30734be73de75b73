//! Cancellable single-shot timer
//!
//! The timer holds a deadline rather than a callback. The owner's event loop
//! polls it (`take_due`) on the same thread that processes samples, so firing
//! never races with sample handling.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebounceTimer {
    deadline: Option<DateTime<Utc>>,
}

impl DebounceTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending shot and schedule a new one at `now + window`
    pub fn rearm(&mut self, now: DateTime<Utc>, window: Duration) {
        self.deadline = Some(now + window);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Fire the timer if its deadline has passed. A fired timer is disarmed.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
