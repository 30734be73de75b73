//! Local calendar-day resolution
//!
//! Day boundaries are wall-clock midnights in the device's local time. The
//! resolver is injected so tests and replays can pin a fixed offset.

use crate::error::EngineError;
use crate::types::CalendarDay;
use chrono::{DateTime, Duration, FixedOffset, Local, Offset, TimeZone, Utc};

/// Maps instants to local calendar days
pub trait DayResolver: Send + Sync {
    /// Calendar day containing `instant` in local time
    fn day_of(&self, instant: DateTime<Utc>) -> CalendarDay;

    /// First instant of the local day following the one containing `instant`
    fn next_midnight(&self, instant: DateTime<Utc>) -> DateTime<Utc>;
}

/// Resolves days using the host's local timezone
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDays;

impl DayResolver for LocalDays {
    fn day_of(&self, instant: DateTime<Utc>) -> CalendarDay {
        CalendarDay::new(instant.with_timezone(&Local).date_naive())
    }

    fn next_midnight(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        next_midnight_in(&Local, self.day_of(instant), instant)
    }
}

/// Resolves days at a fixed UTC offset
#[derive(Debug, Clone, Copy)]
pub struct FixedOffsetDays {
    offset: FixedOffset,
}

impl FixedOffsetDays {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// Offset east of UTC in whole minutes (e.g. `-300` for UTC-5)
    pub fn from_minutes(minutes: i32) -> Result<Self, EngineError> {
        minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .map(Self::new)
            .ok_or_else(|| EngineError::InvalidConfig(format!("utc offset out of range: {minutes}m")))
    }
}

impl DayResolver for FixedOffsetDays {
    fn day_of(&self, instant: DateTime<Utc>) -> CalendarDay {
        CalendarDay::new(instant.with_timezone(&self.offset).date_naive())
    }

    fn next_midnight(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        next_midnight_in(&self.offset, self.day_of(instant), instant)
    }
}

fn next_midnight_in<Tz: TimeZone>(tz: &Tz, today: CalendarDay, instant: DateTime<Utc>) -> DateTime<Utc> {
    // A DST jump can skip local midnight entirely; fall back to re-checking in an hour.
    today
        .next()
        .date()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| instant + Duration::hours(1))
}
