//! Delta accumulation over raw step-counter samples
//!
//! The hardware counter is cumulative since its last reboot. Each sample is
//! turned into a delta against the previous one; any decrease is treated as a
//! counter reset and becomes a new baseline instead of a delta.

use crate::types::Observation;
use serde::{Deserialize, Serialize};

/// Running "steps today" total built from raw counter samples
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaAccumulator {
    /// Last raw value seen; `None` until the first baseline arrives
    last_raw: Option<i64>,
    /// Steps accumulated for the current day
    today_steps: u32,
    /// When set, samples advance the baseline without adding steps
    paused: bool,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a previously persisted total with an uninitialized baseline
    pub fn restored(today_steps: u32, paused: bool) -> Self {
        Self {
            last_raw: None,
            today_steps,
            paused,
        }
    }

    /// Feed one raw counter value.
    ///
    /// The first sample, and any sample lower than its predecessor, only sets
    /// the baseline. Paused samples also move the baseline so that resuming
    /// does not replay the paused interval.
    pub fn observe(&mut self, raw: i64) -> Observation {
        let previous = match self.last_raw {
            Some(previous) if raw >= previous => previous,
            _ => {
                self.last_raw = Some(raw);
                return Observation::rejected();
            }
        };

        self.last_raw = Some(raw);
        if self.paused {
            return Observation::rejected();
        }

        let delta = u32::try_from(raw.abs_diff(previous)).unwrap_or(u32::MAX);
        self.today_steps = self.today_steps.saturating_add(delta);
        Observation::applied(delta)
    }

    pub fn today_steps(&self) -> u32 {
        self.today_steps
    }

    pub fn last_raw(&self) -> Option<i64> {
        self.last_raw
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Toggle pause; the baseline is left untouched
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Forget the baseline so the next sample is treated as a fresh start
    pub fn reset_baseline(&mut self) {
        self.last_raw = None;
    }

    /// Zero the total for a new day, keeping the baseline
    pub fn reset_total(&mut self) {
        self.today_steps = 0;
    }

    /// Overwrite the total with an externally supplied value
    pub fn set_total(&mut self, steps: u32) {
        self.today_steps = steps;
    }
}
