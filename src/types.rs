//! Core types for the Pacekeeper engine
//!
//! These are the values that flow between the accumulator, the day tracker,
//! the write-back scheduler and the stores/surfaces around them.

use crate::error::EngineError;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A local-time calendar date, independent of time-of-day.
///
/// Serialized as `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalendarDay(NaiveDate);

impl CalendarDay {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Build a day from its components, rejecting impossible dates
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Result<Self, EngineError> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(Self)
            .ok_or_else(|| EngineError::InvalidDay(format!("{year:04}-{month:02}-{day:02}")))
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// The following calendar day
    pub fn next(&self) -> Self {
        Self(self.0.succ_opt().unwrap_or(self.0))
    }

    /// The preceding calendar day
    pub fn previous(&self) -> Self {
        Self(self.0.pred_opt().unwrap_or(self.0))
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }
}

impl fmt::Display for CalendarDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for CalendarDay {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(Self)
            .map_err(|e| EngineError::InvalidDay(format!("{s}: {e}")))
    }
}

/// Durable per-day step total. `day` is the natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStepRecord {
    pub day: CalendarDay,
    pub steps: u32,
}

impl DailyStepRecord {
    pub fn new(day: CalendarDay, steps: u32) -> Self {
        Self { day, steps }
    }
}

/// Result of feeding one raw sensor value through the accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Observation {
    /// Steps added to today's total (0 when not accepted)
    pub applied_delta: u32,
    /// Whether the sample contributed a delta to today's total
    pub accepted: bool,
}

impl Observation {
    pub(crate) fn rejected() -> Self {
        Self {
            applied_delta: 0,
            accepted: false,
        }
    }

    pub(crate) fn applied(delta: u32) -> Self {
        Self {
            applied_delta: delta,
            accepted: true,
        }
    }
}

/// State pushed to notification, widgets and subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub day: CalendarDay,
    pub steps: u32,
    pub paused: bool,
    pub goal_reached: bool,
}

/// Crash-recovery mirror of the running total
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastSnapshot {
    pub steps: u32,
    pub day: CalendarDay,
    #[serde(default)]
    pub paused: bool,
    /// Ended days whose archive has not reached the durable store yet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<DailyStepRecord>,
}

impl FastSnapshot {
    pub fn new(steps: u32, day: CalendarDay, paused: bool) -> Self {
        Self {
            steps,
            day,
            paused,
            pending: Vec::new(),
        }
    }
}
