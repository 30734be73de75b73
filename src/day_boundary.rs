//! Day rollover detection
//!
//! Every public entry point of the engine first asks the tracker whether the
//! stored day still matches the local calendar day. Staleness is detected and
//! resolved within the same call, so there is no lingering "stale" state.

use crate::accumulator::DeltaAccumulator;
use crate::calendar::DayResolver;
use crate::goal::GoalLatch;
use crate::types::{CalendarDay, DailyStepRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a rollover was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rollover {
    /// Midnight passed; the ending day's total must be archived
    Natural {
        archived: DailyStepRecord,
        started: CalendarDay,
    },
    /// An external actor supplies the new total; nothing is archived
    Manual {
        previous: CalendarDay,
        started: CalendarDay,
    },
}

impl Rollover {
    pub fn started(&self) -> CalendarDay {
        match self {
            Rollover::Natural { started, .. } | Rollover::Manual { started, .. } => *started,
        }
    }

    /// Record that must reach the durable store, if any
    pub fn archived(&self) -> Option<DailyStepRecord> {
        match self {
            Rollover::Natural { archived, .. } => Some(*archived),
            Rollover::Manual { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayBoundaryTracker {
    current_day: CalendarDay,
}

impl DayBoundaryTracker {
    pub fn new(current_day: CalendarDay) -> Self {
        Self { current_day }
    }

    pub fn current_day(&self) -> CalendarDay {
        self.current_day
    }

    /// Bring `current_day` in line with the local day of `now`.
    ///
    /// A natural rollover returns the ending day's record and zeroes the
    /// total. A manual override keeps the total (the caller overwrites it)
    /// but forgets the raw baseline. Both reset the goal latch.
    pub fn ensure_current_day(
        &mut self,
        now: DateTime<Utc>,
        manual_override: bool,
        resolver: &dyn DayResolver,
        accumulator: &mut DeltaAccumulator,
        goal: &mut GoalLatch,
    ) -> Option<Rollover> {
        let today = resolver.day_of(now);
        if today == self.current_day {
            return None;
        }

        let previous = self.current_day;
        self.current_day = today;
        goal.reset();

        if manual_override {
            accumulator.reset_baseline();
            return Some(Rollover::Manual {
                previous,
                started: today,
            });
        }

        let archived = DailyStepRecord::new(previous, accumulator.today_steps());
        accumulator.reset_total();
        Some(Rollover::Natural {
            archived,
            started: today,
        })
    }

    /// Move to an explicitly supplied day (manual override path)
    pub fn set_current_day(&mut self, day: CalendarDay) {
        self.current_day = day;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::FixedOffsetDays;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    fn day(d: u32) -> CalendarDay {
        CalendarDay::from_ymd(2024, 1, d).unwrap()
    }

    #[test]
    fn test_same_day_is_noop() {
        let resolver = FixedOffsetDays::utc();
        let mut tracker = DayBoundaryTracker::new(day(15));
        let mut acc = DeltaAccumulator::restored(4321, false);
        let mut goal = GoalLatch::new(Some(10));
        goal.check(4321);

        let result = tracker.ensure_current_day(at(15, 23), false, &resolver, &mut acc, &mut goal);
        assert!(result.is_none());
        assert_eq!(acc.today_steps(), 4321);
        assert!(goal.is_reached());
    }

    #[test]
    fn test_natural_rollover_archives_and_resets() {
        let resolver = FixedOffsetDays::utc();
        let mut tracker = DayBoundaryTracker::new(day(15));
        let mut acc = DeltaAccumulator::restored(4321, false);
        acc.observe(70_000);
        let mut goal = GoalLatch::new(Some(1_000));
        goal.check(4321);

        let rollover = tracker
            .ensure_current_day(at(16, 0), false, &resolver, &mut acc, &mut goal)
            .unwrap();

        assert_eq!(rollover.archived(), Some(DailyStepRecord::new(day(15), 4321)));
        assert_eq!(rollover.started(), day(16));
        assert_eq!(tracker.current_day(), day(16));
        assert_eq!(acc.today_steps(), 0);
        // The baseline survives a natural rollover
        assert_eq!(acc.last_raw(), Some(70_000));
        assert!(!goal.is_reached());
    }

    #[test]
    fn test_manual_rollover_skips_archive() {
        let resolver = FixedOffsetDays::utc();
        let mut tracker = DayBoundaryTracker::new(day(15));
        let mut acc = DeltaAccumulator::restored(4321, false);
        acc.observe(70_000);
        let mut goal = GoalLatch::new(Some(1_000));
        goal.check(4321);

        let rollover = tracker
            .ensure_current_day(at(16, 9), true, &resolver, &mut acc, &mut goal)
            .unwrap();

        assert_eq!(rollover.archived(), None);
        assert_eq!(
            rollover,
            Rollover::Manual {
                previous: day(15),
                started: day(16)
            }
        );
        assert_eq!(acc.today_steps(), 4321);
        assert_eq!(acc.last_raw(), None);
        assert!(!goal.is_reached());
    }

    #[test]
    fn test_multi_day_gap_archives_last_known_day() {
        let resolver = FixedOffsetDays::utc();
        let mut tracker = DayBoundaryTracker::new(day(10));
        let mut acc = DeltaAccumulator::restored(800, false);
        let mut goal = GoalLatch::default();

        let rollover = tracker
            .ensure_current_day(at(14, 8), false, &resolver, &mut acc, &mut goal)
            .unwrap();
        assert_eq!(rollover.archived(), Some(DailyStepRecord::new(day(10), 800)));
        assert_eq!(tracker.current_day(), day(14));
    }
}
