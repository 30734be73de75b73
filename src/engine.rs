//! Step engine
//!
//! `StepEngine` owns the accumulator, the day tracker, the goal latch and the
//! write-back scheduler, and drives the stores and surfaces injected at
//! construction. It is a single-writer state machine: every entry point takes
//! `&mut self` plus the current instant, and none of them surface I/O errors.
//! Failed writes are logged, counted in [`EngineStats`] and retried later.

use crate::accumulator::DeltaAccumulator;
use crate::calendar::{DayResolver, LocalDays};
use crate::config::EngineConfig;
use crate::day_boundary::{DayBoundaryTracker, Rollover};
use crate::error::EngineError;
use crate::goal::GoalLatch;
use crate::import::{self, ImportReport};
use crate::power::{PowerModeSignal, PowerToggle};
use crate::scheduler::{millis, FlushPlan, FlushTrigger, WriteBackScheduler, WriteBackTimestamps};
use crate::store::{DurableStore, FastPersistence, MemoryDurableStore, MemoryFastPersistence};
use crate::surfaces::{ExternalSurfaces, SurfaceHub};
use crate::types::{CalendarDay, DailyStepRecord, FastSnapshot, Observation, StepSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Running counters, reported by `pace stats` and the FFI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub samples: u64,
    pub accepted: u64,
    pub sensor_resets: u64,
    pub rollovers: u64,
    pub overrides: u64,
    pub durable_writes: u64,
    pub durable_failures: u64,
    pub fast_writes: u64,
    pub fast_failures: u64,
    pub publishes: u64,
    pub pending_archives: usize,
}

/// What one sample did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleOutcome {
    pub observation: Observation,
    pub rollover: Option<Rollover>,
    /// Write-backs that were due for this sample
    pub flushed: FlushPlan,
    /// The daily goal was crossed by this sample
    pub goal_reached: bool,
}

/// What one timer pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub rollover: Option<Rollover>,
    pub debounce_fired: bool,
    pub flushed: FlushPlan,
}

/// Collaborators for a [`StepEngine`]. Anything not supplied falls back to
/// an in-memory store, a power signal that is never active, no surfaces and
/// the host's local timezone.
pub struct StepEngineBuilder {
    config: EngineConfig,
    durable: Option<Arc<dyn DurableStore>>,
    fast: Option<Arc<dyn FastPersistence>>,
    power: Option<Arc<dyn PowerModeSignal>>,
    resolver: Option<Arc<dyn DayResolver>>,
    surfaces: SurfaceHub,
}

impl StepEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            durable: None,
            fast: None,
            power: None,
            resolver: None,
            surfaces: SurfaceHub::new(),
        }
    }

    pub fn durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn fast_persistence(mut self, fast: Arc<dyn FastPersistence>) -> Self {
        self.fast = Some(fast);
        self
    }

    pub fn power_signal(mut self, power: Arc<dyn PowerModeSignal>) -> Self {
        self.power = Some(power);
        self
    }

    pub fn day_resolver(mut self, resolver: Arc<dyn DayResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Add a surface; may be called repeatedly
    pub fn surface(mut self, surface: Arc<dyn ExternalSurfaces>) -> Self {
        self.surfaces.add(surface);
        self
    }

    /// Validate the config, recover from fast persistence and start at `now`
    pub fn build(self, now: DateTime<Utc>) -> Result<StepEngine, EngineError> {
        self.config.validate()?;

        let resolver = self.resolver.unwrap_or_else(|| Arc::new(LocalDays));
        let today = resolver.day_of(now);

        let mut engine = StepEngine {
            instance_id: Uuid::new_v4(),
            accumulator: DeltaAccumulator::new(),
            tracker: DayBoundaryTracker::new(today),
            goal: GoalLatch::new(self.config.daily_goal),
            scheduler: WriteBackScheduler::new(&self.config),
            durable: self
                .durable
                .unwrap_or_else(|| Arc::new(MemoryDurableStore::new())),
            fast: self
                .fast
                .unwrap_or_else(|| Arc::new(MemoryFastPersistence::new())),
            power: self.power.unwrap_or_else(|| Arc::new(PowerToggle::default())),
            surfaces: self.surfaces,
            resolver,
            config: self.config,
            pending_archives: Vec::new(),
            durable_written: None,
            fast_written: None,
            durable_retry_at: None,
            fast_retry_at: None,
            durable_degraded: false,
            stats: EngineStats::default(),
        };
        engine.recover(today);

        info!(
            instance = %engine.instance_id,
            day = %today,
            steps = engine.accumulator.today_steps(),
            paused = engine.accumulator.is_paused(),
            "step engine started"
        );
        Ok(engine)
    }
}

pub struct StepEngine {
    instance_id: Uuid,
    config: EngineConfig,
    accumulator: DeltaAccumulator,
    tracker: DayBoundaryTracker,
    goal: GoalLatch,
    scheduler: WriteBackScheduler,
    durable: Arc<dyn DurableStore>,
    fast: Arc<dyn FastPersistence>,
    power: Arc<dyn PowerModeSignal>,
    resolver: Arc<dyn DayResolver>,
    surfaces: SurfaceHub,
    /// Rollover archives whose durable write failed
    pending_archives: Vec<DailyStepRecord>,
    durable_written: Option<DailyStepRecord>,
    fast_written: Option<FastSnapshot>,
    durable_retry_at: Option<DateTime<Utc>>,
    fast_retry_at: Option<DateTime<Utc>>,
    durable_degraded: bool,
    stats: EngineStats,
}

impl StepEngine {
    pub fn builder(config: EngineConfig) -> StepEngineBuilder {
        StepEngineBuilder::new(config)
    }

    /// Feed one raw counter sample
    pub fn record_sample(&mut self, raw: i64, now: DateTime<Utc>) -> SampleOutcome {
        self.stats.samples += 1;
        let rollover = self.roll_day(now, false);

        if let Some(last) = self.accumulator.last_raw().filter(|last| raw < *last) {
            self.stats.sensor_resets += 1;
            debug!(raw, last, "counter went backwards, new baseline");
        }
        let observation = self.accumulator.observe(raw);
        if observation.accepted {
            self.stats.accepted += 1;
        }
        let goal_reached = observation.accepted && self.check_goal();

        let power_saving = self.power.is_power_saving_active();
        let mut plan = self.scheduler.plan(now, power_saving, FlushTrigger::Sample);
        plan.durable &= retry_open(self.durable_retry_at, now);
        plan.fast_persist &= retry_open(self.fast_retry_at, now);
        self.execute(plan, now);
        self.scheduler.rearm_debounce(now, power_saving);

        SampleOutcome {
            observation,
            rollover,
            flushed: plan,
            goal_reached,
        }
    }

    /// Timer pass: day drift, the trailing debounce refresh, and any write
    /// that is overdue while samples are quiet.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let rollover = self.roll_day(now, false);
        let power_saving = self.power.is_power_saving_active();

        let debounce_fired = self.scheduler.take_debounce(now);
        let trigger = if debounce_fired {
            FlushTrigger::Debounce
        } else {
            FlushTrigger::Sample
        };
        let mut plan = self.scheduler.plan(now, power_saving, trigger);
        // Between samples, surfaces only see the trailing refresh
        plan.surface = debounce_fired;
        plan.durable &= self.durable_dirty() && retry_open(self.durable_retry_at, now);
        plan.fast_persist &= self.fast_dirty() && retry_open(self.fast_retry_at, now);
        self.execute(plan, now);

        TickOutcome {
            rollover,
            debounce_fired,
            flushed: plan,
        }
    }

    /// Pause or resume counting. The baseline keeps moving while paused.
    pub fn set_paused(&mut self, paused: bool, now: DateTime<Utc>) {
        self.roll_day(now, false);
        if self.accumulator.is_paused() != paused {
            info!(paused, day = %self.tracker.current_day(), "pause state changed");
        }
        self.accumulator.set_paused(paused);
        self.flush_fast(now);
        self.publish(now);
    }

    /// Replace a day's total with an authoritative value.
    ///
    /// For today this is a manual override: the total is replaced, the raw
    /// baseline is forgotten and every tier is written at once. For any
    /// other day only the durable record is replaced.
    pub fn force_update(&mut self, steps: u32, day: CalendarDay, now: DateTime<Utc>) -> Option<Rollover> {
        self.stats.overrides += 1;

        if day != self.resolver.day_of(now) {
            let rollover = self.roll_day(now, false);
            info!(%day, steps, "history record overridden");
            self.write_record(DailyStepRecord::new(day, steps));
            return rollover;
        }

        let rollover = self.roll_day(now, true);
        self.tracker.set_current_day(day);
        self.accumulator.set_total(steps);
        self.accumulator.reset_baseline();
        info!(%day, steps, "today's total overridden");

        self.check_goal();
        self.execute(FlushPlan::all(), now);
        rollover
    }

    /// Roll the day over if local midnight has passed since the last call
    pub fn ensure_current_day(&mut self, now: DateTime<Utc>) -> Option<Rollover> {
        self.roll_day(now, false)
    }

    /// Write every tier immediately
    pub fn flush_all(&mut self, now: DateTime<Utc>) -> FlushPlan {
        self.roll_day(now, false);
        let plan = FlushPlan::all();
        self.execute(plan, now);
        plan
    }

    /// Import CSV history. Records for other days are upserted as-is; a
    /// record for today only applies when it exceeds the live total, and
    /// then goes through [`StepEngine::force_update`].
    pub fn import_csv(&mut self, text: &str, now: DateTime<Utc>) -> ImportReport {
        self.roll_day(now, false);
        let today = self.tracker.current_day();
        let parsed = import::parse_csv(text, self.resolver.as_ref());
        let mut report = parsed.report;

        let mut today_record = None;
        for (line, record) in parsed.records {
            if record.day == today {
                today_record = Some(record);
                continue;
            }
            match self.durable.upsert(record) {
                Ok(()) => {
                    self.stats.durable_writes += 1;
                    self.pending_archives.retain(|p| p.day != record.day);
                    report.imported += 1;
                }
                Err(e) => report.reject(line, format!("store rejected record: {e}")),
            }
        }

        if let Some(record) = today_record {
            if record.steps > self.accumulator.today_steps() {
                self.force_update(record.steps, record.day, now);
                report.today_override = Some(record);
                report.imported += 1;
            } else {
                debug!(
                    steps = record.steps,
                    live = self.accumulator.today_steps(),
                    "imported total for today is not larger, skipped"
                );
                report.skipped += 1;
            }
        }

        info!(
            total = report.total,
            imported = report.imported,
            failed = report.failed,
            skipped = report.skipped,
            today_override = report.today_override.is_some(),
            "import finished"
        );
        report
    }

    /// Earliest instant at which [`StepEngine::tick`] has work to do
    pub fn next_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let intervals = self.scheduler.intervals(self.power.is_power_saving_active());
        let timestamps = self.scheduler.timestamps();

        let mut deadline = (now + millis(self.config.idle_check_ms)).min(self.resolver.next_midnight(now));
        if let Some(debounce) = self.scheduler.next_deadline() {
            deadline = deadline.min(debounce);
        }
        if self.durable_dirty() {
            let due = timestamps
                .last_durable_write
                .map_or(now, |last| last + intervals.durable_flush);
            deadline = deadline.min(self.durable_retry_at.map_or(due, |retry| due.max(retry)));
        }
        if self.fast_dirty() {
            let due = timestamps
                .last_fast_persist_write
                .map_or(now, |last| last + intervals.fast_persist);
            deadline = deadline.min(self.fast_retry_at.map_or(due, |retry| due.max(retry)));
        }
        deadline.max(now)
    }

    /// When the armed trailing refresh will fire, if any
    pub fn debounce_deadline(&self) -> Option<DateTime<Utc>> {
        self.scheduler.next_deadline()
    }

    pub fn snapshot(&self) -> StepSnapshot {
        StepSnapshot {
            day: self.tracker.current_day(),
            steps: self.accumulator.today_steps(),
            paused: self.accumulator.is_paused(),
            goal_reached: self.goal.is_reached(),
        }
    }

    pub fn current_day(&self) -> CalendarDay {
        self.tracker.current_day()
    }

    pub fn today_steps(&self) -> u32 {
        self.accumulator.today_steps()
    }

    pub fn is_paused(&self) -> bool {
        self.accumulator.is_paused()
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn timestamps(&self) -> WriteBackTimestamps {
        self.scheduler.timestamps()
    }

    pub fn pending_archives(&self) -> &[DailyStepRecord] {
        &self.pending_archives
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            pending_archives: self.pending_archives.len(),
            ..self.stats
        }
    }

    pub fn sum(&self, from: CalendarDay, to: CalendarDay) -> Result<u64, EngineError> {
        self.durable.sum(from, to)
    }

    pub fn average(&self, from: CalendarDay, to: CalendarDay) -> Result<u32, EngineError> {
        self.durable.average(from, to)
    }

    pub fn records(&self, from: CalendarDay, to: CalendarDay) -> Result<Vec<DailyStepRecord>, EngineError> {
        self.durable.records(from, to)
    }

    pub fn min_day(&self) -> Result<Option<CalendarDay>, EngineError> {
        self.durable.min_day()
    }

    pub fn max_day(&self) -> Result<Option<CalendarDay>, EngineError> {
        self.durable.max_day()
    }

    fn recover(&mut self, today: CalendarDay) {
        let snapshot = self.fast.get().unwrap_or_else(|e| {
            warn!(error = %e, "fast persistence unreadable, recovering from durable history");
            None
        });
        let stored_today = self.durable.get(today).unwrap_or_else(|e| {
            warn!(error = %e, "durable store unreadable at startup");
            None
        });

        if let Some(snap) = &snapshot {
            for record in &snap.pending {
                info!(day = %record.day, steps = record.steps, "retrying archive left pending before restart");
                self.write_record(*record);
            }
        }

        let (steps, paused) = match snapshot {
            Some(snap) if snap.day == today => (snap.steps.max(stored_today.unwrap_or(0)), snap.paused),
            Some(snap) => {
                let stored = self.durable.get(snap.day).ok().flatten();
                if stored.map_or(true, |stored| stored < snap.steps) {
                    info!(day = %snap.day, steps = snap.steps, "archiving day recovered from fast persistence");
                    self.write_record(DailyStepRecord::new(snap.day, snap.steps));
                }
                (stored_today.unwrap_or(0), snap.paused)
            }
            None => (stored_today.unwrap_or(0), false),
        };

        self.accumulator = DeltaAccumulator::restored(steps, paused);
        // A goal met before the restart is not announced again
        self.goal.check(steps);
    }

    fn roll_day(&mut self, now: DateTime<Utc>, manual_override: bool) -> Option<Rollover> {
        let rollover = self.tracker.ensure_current_day(
            now,
            manual_override,
            self.resolver.as_ref(),
            &mut self.accumulator,
            &mut self.goal,
        )?;
        self.stats.rollovers += 1;

        match rollover {
            Rollover::Natural { archived, started } => {
                info!(
                    ended = %archived.day,
                    started = %started,
                    steps = archived.steps,
                    "day rollover"
                );
                // A failed archive rides along in the mirror as pending
                self.write_record(archived);
                self.flush_fast(now);
                self.publish(now);
            }
            Rollover::Manual { previous, started } => {
                info!(previous = %previous, started = %started, "day changed by manual override");
            }
        }
        Some(rollover)
    }

    fn check_goal(&mut self) -> bool {
        let steps = self.accumulator.today_steps();
        if !self.goal.check(steps) {
            return false;
        }
        if let Some(target) = self.goal.target() {
            let day = self.tracker.current_day();
            info!(%day, target, steps, "daily goal reached");
            self.surfaces.goal_reached(day, target);
        }
        true
    }

    fn execute(&mut self, plan: FlushPlan, now: DateTime<Utc>) {
        if plan.durable {
            self.flush_durable(now);
        }
        if plan.fast_persist {
            self.flush_fast(now);
        }
        if plan.surface {
            self.publish(now);
        }
    }

    fn current_record(&self) -> DailyStepRecord {
        DailyStepRecord::new(self.tracker.current_day(), self.accumulator.today_steps())
    }

    fn fast_snapshot(&self) -> FastSnapshot {
        FastSnapshot {
            steps: self.accumulator.today_steps(),
            day: self.tracker.current_day(),
            paused: self.accumulator.is_paused(),
            pending: self.pending_archives.clone(),
        }
    }

    fn durable_dirty(&self) -> bool {
        !self.pending_archives.is_empty() || self.durable_written != Some(self.current_record())
    }

    fn fast_dirty(&self) -> bool {
        self.fast_written.as_ref() != Some(&self.fast_snapshot())
    }

    /// Upsert a single record outside the periodic flush. On failure the
    /// record joins the pending archives.
    fn write_record(&mut self, record: DailyStepRecord) -> bool {
        self.pending_archives.retain(|p| p.day != record.day);
        match self.durable.upsert(record) {
            Ok(()) => {
                self.stats.durable_writes += 1;
                true
            }
            Err(e) => {
                self.stats.durable_failures += 1;
                warn!(
                    day = %record.day,
                    steps = record.steps,
                    error = %e,
                    "archive write failed, keeping it for retry"
                );
                self.pending_archives.push(record);
                false
            }
        }
    }

    fn retry_pending_archives(&mut self) {
        if self.pending_archives.is_empty() {
            return;
        }
        for record in std::mem::take(&mut self.pending_archives) {
            match self.durable.upsert(record) {
                Ok(()) => {
                    self.stats.durable_writes += 1;
                    info!(day = %record.day, steps = record.steps, "pending archive written");
                }
                Err(e) => {
                    self.stats.durable_failures += 1;
                    debug!(day = %record.day, error = %e, "pending archive still failing");
                    self.pending_archives.push(record);
                }
            }
        }
    }

    fn flush_durable(&mut self, now: DateTime<Utc>) -> bool {
        self.retry_pending_archives();

        let record = self.current_record();
        match self.durable.upsert(record) {
            Ok(()) => {
                if self.durable_degraded {
                    info!(day = %record.day, steps = record.steps, "durable store writable again");
                    self.durable_degraded = false;
                }
                self.stats.durable_writes += 1;
                self.durable_written = Some(record);
                self.durable_retry_at = None;
                self.scheduler.mark_durable(now);
                true
            }
            Err(e) => {
                self.stats.durable_failures += 1;
                if self.durable_degraded {
                    debug!(day = %record.day, error = %e, "durable flush still failing");
                } else {
                    warn!(
                        day = %record.day,
                        steps = record.steps,
                        error = %e,
                        "durable flush failed, will retry on a later flush"
                    );
                }
                self.durable_degraded = true;
                let interval = self.scheduler.intervals(self.power.is_power_saving_active()).durable_flush;
                self.durable_retry_at = Some(now + interval);
                false
            }
        }
    }

    fn flush_fast(&mut self, now: DateTime<Utc>) -> bool {
        let snapshot = self.fast_snapshot();
        match self.fast.set(snapshot.clone()) {
            Ok(()) => {
                self.stats.fast_writes += 1;
                self.fast_written = Some(snapshot);
                self.fast_retry_at = None;
                self.scheduler.mark_fast_persist(now);
                true
            }
            Err(e) => {
                self.stats.fast_failures += 1;
                warn!(error = %e, "fast persistence write failed");
                let interval = self.scheduler.intervals(self.power.is_power_saving_active()).fast_persist;
                self.fast_retry_at = Some(now + interval);
                false
            }
        }
    }

    fn publish(&mut self, now: DateTime<Utc>) {
        let snapshot = self.snapshot();
        self.surfaces.publish(&snapshot);
        self.stats.publishes += 1;
        self.scheduler.mark_surface(now);
    }
}

fn retry_open(retry_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    retry_at.map_or(true, |at| now >= at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::FixedOffsetDays;
    use crate::surfaces::{ChannelSurface, SurfaceEvent};
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use crossbeam::channel::{self, Receiver};

    struct Harness {
        engine: StepEngine,
        durable: MemoryDurableStore,
        fast: MemoryFastPersistence,
        power: PowerToggle,
        events: Receiver<SurfaceEvent>,
    }

    impl Harness {
        fn publishes(&self) -> usize {
            self.events
                .try_iter()
                .filter(|e| matches!(e, SurfaceEvent::Snapshot(_)))
                .count()
        }

        fn goal_events(&self) -> Vec<SurfaceEvent> {
            self.events
                .try_iter()
                .filter(|e| matches!(e, SurfaceEvent::GoalReached { .. }))
                .collect()
        }
    }

    fn harness_with(config: EngineConfig, fast: MemoryFastPersistence, durable: MemoryDurableStore, now: DateTime<Utc>) -> Harness {
        let power = PowerToggle::default();
        let (tx, events) = channel::unbounded();
        let engine = StepEngine::builder(config)
            .durable_store(Arc::new(durable.clone()))
            .fast_persistence(Arc::new(fast.clone()))
            .power_signal(Arc::new(power.clone()))
            .day_resolver(Arc::new(FixedOffsetDays::utc()))
            .surface(Arc::new(ChannelSurface::new(tx)))
            .build(now)
            .unwrap();
        Harness {
            engine,
            durable,
            fast,
            power,
            events,
        }
    }

    fn harness(now: DateTime<Utc>) -> Harness {
        harness_with(
            EngineConfig::default(),
            MemoryFastPersistence::new(),
            MemoryDurableStore::new(),
            now,
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    fn secs(s: f64) -> Duration {
        Duration::milliseconds((s * 1000.0) as i64)
    }

    fn day(d: u32) -> CalendarDay {
        CalendarDay::from_ymd(2024, 1, d).unwrap()
    }

    #[test]
    fn test_first_sample_is_baseline() {
        let mut h = harness(t0());
        let first = h.engine.record_sample(5_000, t0());
        assert!(!first.observation.accepted);
        assert_eq!(h.engine.today_steps(), 0);

        let second = h.engine.record_sample(5_012, t0() + secs(1.0));
        assert_eq!(second.observation, Observation::applied(12));
        assert_eq!(h.engine.today_steps(), 12);
    }

    #[test]
    fn test_sensor_reset_adds_nothing() {
        let mut h = harness(t0());
        for (i, raw) in [100, 150, 20, 30].into_iter().enumerate() {
            h.engine.record_sample(raw, t0() + secs(i as f64));
        }
        // 150 -> 20 is a reset; only 50 and 10 count
        assert_eq!(h.engine.today_steps(), 60);
        assert_eq!(h.engine.stats().sensor_resets, 1);
    }

    #[test]
    fn test_paused_interval_is_not_counted() {
        let mut h = harness(t0());
        h.engine.record_sample(100, t0());
        h.engine.record_sample(110, t0() + secs(1.0));
        h.engine.set_paused(true, t0() + secs(2.0));
        h.engine.record_sample(120, t0() + secs(3.0));
        h.engine.record_sample(130, t0() + secs(4.0));
        h.engine.set_paused(false, t0() + secs(5.0));
        h.engine.record_sample(140, t0() + secs(6.0));

        assert_eq!(h.engine.today_steps(), 20);
    }

    #[test]
    fn test_set_paused_publishes_and_mirrors_immediately() {
        let mut h = harness(t0());
        h.engine.record_sample(100, t0());
        assert_eq!(h.publishes(), 1);

        h.engine.set_paused(true, t0() + secs(1.0));
        let events: Vec<_> = h.events.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SurfaceEvent::Snapshot(s) if s.paused));
        assert!(h.fast.get().unwrap().unwrap().paused);
    }

    #[test]
    fn test_natural_rollover_archives_day() {
        let evening = Utc.with_ymd_and_hms(2024, 1, 15, 23, 59, 0).unwrap();
        let mut h = harness(evening);
        h.engine.record_sample(0, evening);
        h.engine.record_sample(4_321, evening + secs(10.0));
        assert_eq!(h.engine.today_steps(), 4_321);

        let after_midnight = Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 1).unwrap();
        let tick = h.engine.tick(after_midnight);

        assert_eq!(
            tick.rollover.and_then(|r| r.archived()),
            Some(DailyStepRecord::new(day(15), 4_321))
        );
        assert_eq!(h.durable.get(day(15)).unwrap(), Some(4_321));
        assert_eq!(h.engine.current_day(), day(16));
        assert_eq!(h.engine.today_steps(), 0);
        assert_eq!(h.fast.get().unwrap().map(|s| (s.day, s.steps)), Some((day(16), 0)));

        // The raw baseline carries across midnight
        let next = h.engine.record_sample(4_400, after_midnight + secs(4.0));
        assert_eq!(next.observation.applied_delta, 79);
        assert_eq!(h.engine.today_steps(), 79);
    }

    #[test]
    fn test_sample_after_midnight_counts_toward_new_day() {
        let evening = Utc.with_ymd_and_hms(2024, 1, 15, 23, 59, 50).unwrap();
        let mut h = harness(evening);
        h.engine.record_sample(1_000, evening);
        h.engine.record_sample(1_300, evening + secs(5.0));

        let outcome = h.engine.record_sample(1_350, evening + secs(15.0));
        assert!(outcome.rollover.is_some());
        assert_eq!(h.durable.get(day(15)).unwrap(), Some(300));
        assert_eq!(h.engine.today_steps(), 50);
    }

    #[test]
    fn test_force_update_replaces_total_and_baseline() {
        let mut h = harness(t0());
        h.engine.record_sample(1_000, t0());
        h.engine.record_sample(1_200, t0() + secs(1.0));

        let rollover = h.engine.force_update(500, day(15), t0() + secs(2.0));
        assert!(rollover.is_none());
        assert_eq!(h.durable.writes_for(day(15)), vec![0, 500]);
        assert_eq!(h.durable.len(), 1);
        assert_eq!(h.fast.get().unwrap().map(|s| s.steps), Some(500));

        // Next sample is a fresh baseline, not a jump from 1200
        let next = h.engine.record_sample(9_000, t0() + secs(3.0));
        assert_eq!(next.observation, Observation::rejected());
        assert_eq!(h.engine.today_steps(), 500);
        h.engine.record_sample(9_010, t0() + secs(4.0));
        assert_eq!(h.engine.today_steps(), 510);
    }

    #[test]
    fn test_force_update_after_midnight_skips_archive() {
        let evening = Utc.with_ymd_and_hms(2024, 1, 15, 23, 59, 0).unwrap();
        let mut h = harness(evening);
        h.engine.record_sample(0, evening);
        h.engine.record_sample(800, evening + secs(5.0));

        let morning = Utc.with_ymd_and_hms(2024, 1, 16, 8, 0, 0).unwrap();
        let rollover = h.engine.force_update(1_500, day(16), morning);

        assert!(matches!(rollover, Some(Rollover::Manual { .. })));
        assert_eq!(h.durable.writes_for(day(15)), vec![0]);
        assert_eq!(h.durable.get(day(16)).unwrap(), Some(1_500));
        assert_eq!(h.engine.snapshot().steps, 1_500);
    }

    #[test]
    fn test_force_update_for_past_day_leaves_today_alone() {
        let mut h = harness(t0());
        h.engine.record_sample(0, t0());
        h.engine.record_sample(700, t0() + secs(1.0));

        h.engine.force_update(9_999, day(10), t0() + secs(2.0));
        assert_eq!(h.durable.get(day(10)).unwrap(), Some(9_999));
        assert_eq!(h.engine.current_day(), day(15));
        assert_eq!(h.engine.today_steps(), 700);
    }

    #[test]
    fn test_durable_writes_never_regress_within_day() {
        let mut h = harness(t0());
        let mut raw = 10_000;
        for i in 0..600 {
            raw += (i * 7) % 5;
            h.engine.record_sample(raw, t0() + secs(i as f64 * 0.5));
        }

        let writes = h.durable.writes_for(day(15));
        assert!(writes.len() >= 9, "expected periodic flushes, got {writes:?}");
        assert!(writes.windows(2).all(|w| w[0] <= w[1]), "regressed: {writes:?}");
    }

    #[test]
    fn test_trailing_refresh_fires_once() {
        let mut h = harness(t0());
        for i in 0..4 {
            h.engine.record_sample(100 + i, t0() + secs(i as f64));
        }
        assert_eq!(h.publishes(), 1);

        h.engine.tick(t0() + secs(7.5));
        h.engine.tick(t0() + secs(12.9));
        assert_eq!(h.publishes(), 0);

        let fired = h.engine.tick(t0() + secs(13.0));
        assert!(fired.debounce_fired);
        assert_eq!(h.publishes(), 1);
        assert_eq!(h.events.try_iter().count(), 0);

        for s in [14.0, 30.0, 45.0, 60.0] {
            h.engine.tick(t0() + secs(s));
        }
        assert_eq!(h.publishes(), 0);
    }

    #[test]
    fn test_new_sample_rearms_trailing_refresh() {
        let mut h = harness(t0());
        h.engine.record_sample(100, t0());
        h.engine.record_sample(101, t0() + secs(5.0));
        assert!(!h.engine.tick(t0() + secs(10.0)).debounce_fired);
        assert!(h.engine.tick(t0() + secs(15.0)).debounce_fired);
    }

    #[test]
    fn test_power_saving_stretches_trailing_refresh() {
        let mut h = harness(t0());
        h.power.set(true);
        h.engine.record_sample(100, t0());
        h.publishes();

        assert!(!h.engine.tick(t0() + secs(19.0)).debounce_fired);
        assert!(h.engine.tick(t0() + secs(20.0)).debounce_fired);
        assert_eq!(h.publishes(), 1);
    }

    #[test]
    fn test_goal_latch_fires_once_per_day() {
        let evening = Utc.with_ymd_and_hms(2024, 1, 15, 22, 0, 0).unwrap();
        let config = EngineConfig::default().with_daily_goal(Some(100));
        let mut h = harness_with(
            config,
            MemoryFastPersistence::new(),
            MemoryDurableStore::new(),
            evening,
        );

        h.engine.record_sample(0, evening);
        let mut crossings = 0;
        for i in 1..=10 {
            if h.engine.record_sample(i * 40, evening + secs(i as f64)).goal_reached {
                crossings += 1;
            }
        }
        assert_eq!(crossings, 1);
        assert_eq!(
            h.goal_events(),
            vec![SurfaceEvent::GoalReached {
                day: day(15),
                target: 100
            }]
        );
        assert!(h.engine.snapshot().goal_reached);

        let next_day = Utc.with_ymd_and_hms(2024, 1, 16, 7, 0, 0).unwrap();
        h.engine.tick(next_day);
        assert!(!h.engine.snapshot().goal_reached);

        h.engine.record_sample(500, next_day + secs(1.0));
        h.engine.record_sample(650, next_day + secs(2.0));
        assert_eq!(h.goal_events().len(), 1);
    }

    #[test]
    fn test_manual_override_resets_goal_latch() {
        let evening = Utc.with_ymd_and_hms(2024, 1, 15, 22, 0, 0).unwrap();
        let config = EngineConfig::default().with_daily_goal(Some(100));
        let mut h = harness_with(
            config,
            MemoryFastPersistence::new(),
            MemoryDurableStore::new(),
            evening,
        );
        h.engine.record_sample(0, evening);
        h.engine.record_sample(150, evening + secs(1.0));
        assert!(h.engine.snapshot().goal_reached);

        let morning = Utc.with_ymd_and_hms(2024, 1, 16, 6, 0, 0).unwrap();
        h.engine.force_update(20, day(16), morning);
        assert!(!h.engine.snapshot().goal_reached);
    }

    #[test]
    fn test_recovers_same_day_total() {
        let fast = MemoryFastPersistence::with_snapshot(FastSnapshot::new(1_234, day(15), true));
        let h = harness_with(EngineConfig::default(), fast, MemoryDurableStore::new(), t0());
        assert_eq!(h.engine.today_steps(), 1_234);
        assert!(h.engine.is_paused());
    }

    #[test]
    fn test_recovery_prefers_larger_durable_total() {
        let fast = MemoryFastPersistence::with_snapshot(FastSnapshot::new(100, day(15), false));
        let durable = MemoryDurableStore::new();
        durable.upsert(DailyStepRecord::new(day(15), 180)).unwrap();
        let h = harness_with(EngineConfig::default(), fast, durable, t0());
        assert_eq!(h.engine.today_steps(), 180);
    }

    #[test]
    fn test_recovers_and_archives_earlier_day() {
        let fast = MemoryFastPersistence::with_snapshot(FastSnapshot::new(800, day(13), false));
        let h = harness_with(EngineConfig::default(), fast, MemoryDurableStore::new(), t0());
        assert_eq!(h.durable.get(day(13)).unwrap(), Some(800));
        assert_eq!(h.engine.today_steps(), 0);
        assert_eq!(h.engine.current_day(), day(15));
    }

    #[test]
    fn test_durable_failure_is_retried() {
        let mut h = harness(t0());
        h.durable.set_failing(true);
        h.engine.record_sample(100, t0());
        h.engine.record_sample(160, t0() + secs(1.0));
        assert_eq!(h.engine.stats().durable_failures, 1);
        assert!(h.durable.is_empty());

        h.durable.set_failing(false);
        h.engine.record_sample(170, t0() + secs(2.0));
        assert!(h.durable.is_empty(), "retry waits one flush interval");
        h.engine.record_sample(175, t0() + secs(30.0));
        assert_eq!(h.durable.get(day(15)).unwrap(), Some(75));
    }

    #[test]
    fn test_fast_mirror_failure_is_retried() {
        let mut h = harness(t0());
        h.fast.set_failing(true);
        h.engine.record_sample(100, t0());
        h.engine.record_sample(150, t0() + secs(1.0));
        assert_eq!(h.engine.stats().fast_failures, 1, "second sample waits for the retry");
        assert_eq!(h.fast.get().unwrap(), None);

        h.fast.set_failing(false);
        assert_eq!(h.engine.next_deadline(t0() + secs(5.0)), t0() + secs(7.5));
        let early = h.engine.tick(t0() + secs(5.0));
        assert!(!early.flushed.fast_persist);

        let retry = h.engine.tick(t0() + secs(8.0));
        assert!(retry.flushed.fast_persist);
        assert_eq!(h.fast.get().unwrap().map(|s| s.steps), Some(50));
        assert_eq!(h.engine.stats().fast_writes, 1);
        assert_eq!(h.engine.stats().fast_failures, 1);
    }

    #[test]
    fn test_failed_archive_is_kept_until_written() {
        let evening = Utc.with_ymd_and_hms(2024, 1, 15, 23, 59, 0).unwrap();
        let mut h = harness(evening);
        h.engine.record_sample(0, evening);
        h.engine.record_sample(4_321, evening + secs(10.0));

        h.durable.set_failing(true);
        let midnight = Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 1).unwrap();
        h.engine.tick(midnight);
        assert_eq!(h.engine.pending_archives(), [DailyStepRecord::new(day(15), 4_321)]);
        assert_eq!(h.engine.stats().pending_archives, 1);
        let mirror = h.fast.get().unwrap().unwrap();
        assert_eq!((mirror.day, mirror.steps), (day(16), 0));
        assert_eq!(mirror.pending, vec![DailyStepRecord::new(day(15), 4_321)]);

        h.durable.set_failing(false);
        h.engine.record_sample(4_330, midnight + secs(40.0));
        assert_eq!(h.durable.get(day(15)).unwrap(), Some(4_321));
        assert!(h.engine.pending_archives().is_empty());
    }

    #[test]
    fn test_pending_archive_survives_restart() {
        let mut snapshot = FastSnapshot::new(40, day(15), false);
        snapshot.pending.push(DailyStepRecord::new(day(14), 6_500));
        let fast = MemoryFastPersistence::with_snapshot(snapshot);

        let h = harness_with(EngineConfig::default(), fast, MemoryDurableStore::new(), t0());
        assert_eq!(h.durable.get(day(14)).unwrap(), Some(6_500));
        assert!(h.engine.pending_archives().is_empty());
        assert_eq!(h.engine.today_steps(), 40);
    }

    #[test]
    fn test_quiet_tick_flushes_dirty_durable_record() {
        let mut h = harness(t0());
        h.engine.record_sample(0, t0());
        h.engine.record_sample(25, t0() + secs(1.0));
        assert_eq!(h.durable.get(day(15)).unwrap(), Some(0));
        assert!(h.engine.tick(t0() + secs(11.0)).debounce_fired);

        let tick = h.engine.tick(t0() + secs(30.0));
        assert!(tick.flushed.durable);
        assert!(!tick.flushed.surface);
        assert_eq!(h.durable.get(day(15)).unwrap(), Some(25));

        // Nothing changed since, so nothing is rewritten
        let tick = h.engine.tick(t0() + secs(90.0));
        assert!(!tick.flushed.durable);
    }

    #[test]
    fn test_next_deadline_tracks_debounce() {
        let mut h = harness(t0());
        h.engine.record_sample(0, t0());
        assert_eq!(h.engine.next_deadline(t0()), t0() + secs(10.0));
        h.engine.tick(t0() + secs(10.0));
        assert_eq!(
            h.engine.next_deadline(t0() + secs(10.0)),
            t0() + secs(70.0)
        );
    }

    #[test]
    fn test_import_applies_history_and_today_override() {
        let mut h = harness(t0());
        h.engine.record_sample(0, t0());
        h.engine.record_sample(300, t0() + secs(1.0));

        let csv = "2024-01-13,5000\n2024-01-14,6000\nbad line\n2024-01-15,9000\n";
        let report = h.engine.import_csv(csv, t0() + secs(2.0));

        assert_eq!(report.total, 4);
        assert_eq!(report.imported, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.today_override, Some(DailyStepRecord::new(day(15), 9_000)));
        assert_eq!(h.engine.today_steps(), 9_000);
        assert_eq!(h.engine.sum(day(13), day(15)).unwrap(), 20_000);
        assert_eq!(h.engine.min_day().unwrap(), Some(day(13)));
    }

    #[test]
    fn test_import_keeps_larger_live_total() {
        let mut h = harness(t0());
        h.engine.record_sample(0, t0());
        h.engine.record_sample(300, t0() + secs(1.0));

        let report = h.engine.import_csv("2024-01-14,700\n2024-01-15,100\n", t0() + secs(2.0));
        assert_eq!(report.today_override, None);
        assert_eq!(report.total, 2);
        assert_eq!(report.imported, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(h.engine.today_steps(), 300);
    }

    #[test]
    fn test_history_queries_after_flush_all() {
        let mut h = harness(t0());
        h.durable.upsert(DailyStepRecord::new(day(14), 1_001)).unwrap();
        h.engine.record_sample(0, t0());
        h.engine.record_sample(2_000, t0() + secs(1.0));
        h.engine.flush_all(t0() + secs(2.0));

        assert_eq!(h.engine.sum(day(14), day(15)).unwrap(), 3_001);
        assert_eq!(h.engine.average(day(14), day(15)).unwrap(), 1_500);
        assert_eq!(h.engine.max_day().unwrap(), Some(day(15)));
        assert_eq!(h.engine.records(day(15), day(15)).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = EngineConfig {
            debounce_ms: 0,
            ..EngineConfig::default()
        };
        assert!(StepEngine::builder(config).build(t0()).is_err());
    }
}
