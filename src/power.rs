//! Power-saving signal
//!
//! Read synchronously on every scheduling decision; it only stretches or
//! shrinks the write-back intervals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub trait PowerModeSignal: Send + Sync {
    fn is_power_saving_active(&self) -> bool;
}

/// Shared, externally toggled power-saving flag
#[derive(Debug, Clone, Default)]
pub struct PowerToggle {
    active: Arc<AtomicBool>,
}

impl PowerToggle {
    pub fn new(active: bool) -> Self {
        Self {
            active: Arc::new(AtomicBool::new(active)),
        }
    }

    pub fn set(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }
}

impl PowerModeSignal for PowerToggle {
    fn is_power_saving_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}
