//! Write-back scheduling
//!
//! Samples can arrive many times per second. The scheduler decides, per
//! sample, which of the three write-backs are due:
//!
//! - fast-persistence mirror (cheap crash-recovery copy of the total)
//! - durable-store flush (authoritative per-day record)
//! - external-surface refresh (notification, widgets, subscribers)
//!
//! A trailing debounce timer guarantees one refresh once samples stop. All
//! intervals are stretched by `power_saving_factor` while power saving is on.

use crate::config::{EngineConfig, MAX_POWER_SAVING_FACTOR};
use crate::timer::DebounceTimer;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Interval set for one power mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushIntervals {
    pub fast_persist: Duration,
    pub durable_flush: Duration,
    pub surface_refresh: Duration,
    pub debounce: Duration,
}

impl FlushIntervals {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            fast_persist: millis(config.fast_persist_interval_ms),
            durable_flush: millis(config.durable_flush_interval_ms),
            surface_refresh: millis(config.surface_refresh_interval_ms),
            debounce: millis(config.debounce_ms),
        }
    }

    fn stretched(&self, factor: i32) -> Self {
        Self {
            fast_persist: self.fast_persist * factor,
            durable_flush: self.durable_flush * factor,
            surface_refresh: self.surface_refresh * factor,
            debounce: self.debounce * factor,
        }
    }
}

/// Intervals beyond a year are clamped so stretched durations stay in range
const MAX_INTERVAL_MS: u64 = 366 * 24 * 3_600_000;

pub(crate) fn millis(ms: u64) -> Duration {
    Duration::milliseconds(ms.min(MAX_INTERVAL_MS) as i64)
}

/// Wall-clock instants of the last successful write-backs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBackTimestamps {
    pub last_fast_persist_write: Option<DateTime<Utc>>,
    pub last_durable_write: Option<DateTime<Utc>>,
    pub last_surface_refresh: Option<DateTime<Utc>>,
}

/// What caused a scheduling pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// A sample was observed (accepted or not)
    Sample,
    /// The trailing debounce timer fired
    Debounce,
    /// Manual override; everything is written immediately
    Forced,
}

/// Write-backs due in one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushPlan {
    pub durable: bool,
    pub fast_persist: bool,
    pub surface: bool,
}

impl FlushPlan {
    pub fn all() -> Self {
        Self {
            durable: true,
            fast_persist: true,
            surface: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.durable || self.fast_persist || self.surface)
    }
}

#[derive(Debug, Clone)]
pub struct WriteBackScheduler {
    normal: FlushIntervals,
    power_saving_factor: i32,
    timestamps: WriteBackTimestamps,
    debounce: DebounceTimer,
}

impl WriteBackScheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            normal: FlushIntervals::from_config(config),
            power_saving_factor: config.power_saving_factor.clamp(1, MAX_POWER_SAVING_FACTOR) as i32,
            timestamps: WriteBackTimestamps::default(),
            debounce: DebounceTimer::new(),
        }
    }

    /// Intervals in effect for the given power mode
    pub fn intervals(&self, power_saving: bool) -> FlushIntervals {
        if power_saving {
            self.normal.stretched(self.power_saving_factor)
        } else {
            self.normal
        }
    }

    pub fn plan(&self, now: DateTime<Utc>, power_saving: bool, trigger: FlushTrigger) -> FlushPlan {
        if trigger == FlushTrigger::Forced {
            return FlushPlan::all();
        }

        let intervals = self.intervals(power_saving);
        FlushPlan {
            durable: elapsed(self.timestamps.last_durable_write, now, intervals.durable_flush),
            fast_persist: elapsed(
                self.timestamps.last_fast_persist_write,
                now,
                intervals.fast_persist,
            ),
            surface: trigger == FlushTrigger::Debounce
                || elapsed(self.timestamps.last_surface_refresh, now, intervals.surface_refresh),
        }
    }

    pub fn mark_durable(&mut self, now: DateTime<Utc>) {
        self.timestamps.last_durable_write = Some(now);
    }

    pub fn mark_fast_persist(&mut self, now: DateTime<Utc>) {
        self.timestamps.last_fast_persist_write = Some(now);
    }

    pub fn mark_surface(&mut self, now: DateTime<Utc>) {
        self.timestamps.last_surface_refresh = Some(now);
    }

    /// Cancel the pending trailing refresh and schedule a new one
    pub fn rearm_debounce(&mut self, now: DateTime<Utc>, power_saving: bool) {
        let window = self.intervals(power_saving).debounce;
        self.debounce.rearm(now, window);
    }

    /// Fire the trailing refresh if its quiet period has passed
    pub fn take_debounce(&mut self, now: DateTime<Utc>) -> bool {
        self.debounce.take_due(now)
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.debounce.deadline()
    }

    pub fn timestamps(&self) -> WriteBackTimestamps {
        self.timestamps
    }
}

/// Interval check. A clock that moved backwards counts as elapsed so writes
/// cannot stall until wall time catches up again.
fn elapsed(last: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    match last {
        None => true,
        Some(last) => {
            let since = now.signed_duration_since(last);
            since < Duration::zero() || since >= interval
        }
    }
}
