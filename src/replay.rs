//! Deterministic replay of engine events
//!
//! Events are newline-delimited JSON, one per line:
//!
//! ```text
//! {"ts":"2024-01-15T08:00:00Z","event":"sample","raw":1200}
//! {"ts":"2024-01-15T08:00:05Z","event":"pause"}
//! {"ts":"2024-01-15T09:00:00Z","event":"force","steps":500,"day":"2024-01-15"}
//! {"ts":"2024-01-15T09:00:00Z","event":"power","saving":true}
//! ```
//!
//! Time is virtual: before each event the replayer fires every timer that
//! would have come due in between, in order.

use crate::engine::{EngineStats, StepEngine};
use crate::error::EngineError;
use crate::power::PowerToggle;
use crate::types::{CalendarDay, StepSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayEvent {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ReplayKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReplayKind {
    Sample { raw: i64 },
    Pause,
    Resume,
    Force { steps: u32, day: CalendarDay },
    Power { saving: bool },
    /// Explicit timer pass with no other input
    Tick,
}

/// Parse an NDJSON event stream. Timestamps must not go backwards.
pub fn parse_ndjson(text: &str) -> Result<Vec<ReplayEvent>, EngineError> {
    let mut events: Vec<ReplayEvent> = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: ReplayEvent = serde_json::from_str(line)
            .map_err(|e| EngineError::InvalidRecord(format!("line {}: {e}", index + 1)))?;
        if let Some(previous) = events.last() {
            if event.ts < previous.ts {
                return Err(EngineError::InvalidRecord(format!(
                    "line {}: timestamp {} is earlier than {}",
                    index + 1,
                    event.ts,
                    previous.ts
                )));
            }
        }
        events.push(event);
    }
    Ok(events)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub events: usize,
    pub ticks: usize,
    pub snapshot: StepSnapshot,
    pub stats: EngineStats,
}

/// Drives a [`StepEngine`] through recorded events in virtual time
pub struct Replayer {
    engine: StepEngine,
    power: PowerToggle,
    cursor: Option<DateTime<Utc>>,
    last_tick: Option<DateTime<Utc>>,
    events: usize,
    ticks: usize,
}

impl Replayer {
    /// `power` must be the toggle the engine was built with
    pub fn new(engine: StepEngine, power: PowerToggle) -> Self {
        Self {
            engine,
            power,
            cursor: None,
            last_tick: None,
            events: 0,
            ticks: 0,
        }
    }

    pub fn engine(&self) -> &StepEngine {
        &self.engine
    }

    pub fn apply(&mut self, event: &ReplayEvent) {
        self.advance_to(event.ts);
        self.events += 1;

        match event.kind {
            ReplayKind::Sample { raw } => {
                self.engine.record_sample(raw, event.ts);
            }
            ReplayKind::Pause => self.engine.set_paused(true, event.ts),
            ReplayKind::Resume => self.engine.set_paused(false, event.ts),
            ReplayKind::Force { steps, day } => {
                self.engine.force_update(steps, day, event.ts);
            }
            ReplayKind::Power { saving } => self.power.set(saving),
            ReplayKind::Tick => self.tick(event.ts),
        }
    }

    pub fn apply_all(&mut self, events: &[ReplayEvent]) {
        for event in events {
            self.apply(event);
        }
    }

    /// Fire every timer due up to and including `until`
    pub fn advance_to(&mut self, until: DateTime<Utc>) {
        let Some(mut cursor) = self.cursor else {
            self.cursor = Some(until);
            return;
        };

        while cursor <= until {
            let due = self.engine.next_deadline(cursor);
            if due > until || self.last_tick == Some(due) {
                break;
            }
            self.tick(due);
            cursor = due;
        }
        self.cursor = Some(until.max(cursor));
    }

    /// Let the trailing refresh fire, flush every tier and hand the engine back
    pub fn finish(mut self) -> (StepEngine, ReplaySummary) {
        if let Some(deadline) = self.engine.debounce_deadline() {
            self.advance_to(deadline);
        }
        if let Some(cursor) = self.cursor {
            self.engine.flush_all(cursor);
        }

        let summary = ReplaySummary {
            events: self.events,
            ticks: self.ticks,
            snapshot: self.engine.snapshot(),
            stats: self.engine.stats(),
        };
        (self.engine, summary)
    }

    fn tick(&mut self, now: DateTime<Utc>) {
        self.engine.tick(now);
        self.ticks += 1;
        self.last_tick = Some(now);
    }
}
