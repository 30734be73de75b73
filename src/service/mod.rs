//! Single-threaded engine service
//!
//! Sensor callbacks, UI commands and timers may come from any thread. They
//! are funneled into one queue and processed serially on the engine thread,
//! which sleeps until the next deadline the engine reports (trailing refresh,
//! overdue write, local midnight, or the idle bound).

pub mod worker;

pub use worker::OffloadedDurableStore;

use crate::engine::{EngineStats, StepEngine};
use crate::error::EngineError;
use crate::import::ImportReport;
use crate::types::{CalendarDay, StepSnapshot};
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Source of "now" for the service loop
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Work for the engine thread
pub enum EngineEvent {
    Sample(i64),
    SetPaused(bool),
    ForceUpdate { steps: u32, day: CalendarDay },
    Import { csv: String, reply: Sender<ImportReport> },
    Snapshot(Sender<StepSnapshot>),
    Stats(Sender<EngineStats>),
    Flush,
    Shutdown,
}

/// Cheap, cloneable sender side of the engine queue
#[derive(Clone)]
pub struct EngineHandle {
    sender: Sender<EngineEvent>,
}

impl EngineHandle {
    pub fn send(&self, event: EngineEvent) -> Result<(), EngineError> {
        self.sender.send(event).map_err(|_| EngineError::ServiceStopped)
    }

    pub fn record_sample(&self, raw: i64) -> Result<(), EngineError> {
        self.send(EngineEvent::Sample(raw))
    }

    pub fn set_paused(&self, paused: bool) -> Result<(), EngineError> {
        self.send(EngineEvent::SetPaused(paused))
    }

    pub fn force_update(&self, steps: u32, day: CalendarDay) -> Result<(), EngineError> {
        self.send(EngineEvent::ForceUpdate { steps, day })
    }

    pub fn flush(&self) -> Result<(), EngineError> {
        self.send(EngineEvent::Flush)
    }

    pub fn import_csv(&self, csv: impl Into<String>) -> Result<ImportReport, EngineError> {
        let (reply, response) = channel::bounded(1);
        self.send(EngineEvent::Import {
            csv: csv.into(),
            reply,
        })?;
        response.recv().map_err(|_| EngineError::ServiceStopped)
    }

    pub fn snapshot(&self) -> Result<StepSnapshot, EngineError> {
        let (reply, response) = channel::bounded(1);
        self.send(EngineEvent::Snapshot(reply))?;
        response.recv().map_err(|_| EngineError::ServiceStopped)
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let (reply, response) = channel::bounded(1);
        self.send(EngineEvent::Stats(reply))?;
        response.recv().map_err(|_| EngineError::ServiceStopped)
    }
}

/// The engine running on its own thread
pub struct EngineService {
    handle: EngineHandle,
    thread: JoinHandle<StepEngine>,
}

impl EngineService {
    /// Run `engine` against the wall clock
    pub fn spawn(engine: StepEngine) -> Result<Self, EngineError> {
        Self::spawn_with_clock(engine, Arc::new(Utc::now))
    }

    pub fn spawn_with_clock(engine: StepEngine, clock: Clock) -> Result<Self, EngineError> {
        let (sender, receiver) = channel::unbounded();
        let thread = thread::Builder::new()
            .name("pace-engine".to_string())
            .spawn(move || run(engine, receiver, clock))?;
        Ok(Self {
            handle: EngineHandle { sender },
            thread,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Stop the loop, flush every tier and return the engine
    pub fn shutdown(self) -> Result<StepEngine, EngineError> {
        // The loop also stops once every handle is gone
        let _ = self.handle.send(EngineEvent::Shutdown);
        self.thread.join().map_err(|_| EngineError::ServiceStopped)
    }
}

fn run(mut engine: StepEngine, events: Receiver<EngineEvent>, clock: Clock) -> StepEngine {
    tracing::info!(instance = %engine.instance_id(), "engine service started");

    loop {
        let now = clock();
        let deadline = engine.next_deadline(now);
        let wait = (deadline - now).to_std().unwrap_or(Duration::ZERO);

        match events.recv_deadline(Instant::now() + wait) {
            Ok(EngineEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(event) => {
                handle(&mut engine, event, clock());
                let now = clock();
                if engine.next_deadline(now) <= now {
                    engine.tick(now);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                engine.tick(clock());
            }
        }
    }

    engine.flush_all(clock());
    tracing::info!(
        instance = %engine.instance_id(),
        steps = engine.today_steps(),
        "engine service stopped"
    );
    engine
}

fn handle(engine: &mut StepEngine, event: EngineEvent, now: DateTime<Utc>) {
    match event {
        EngineEvent::Sample(raw) => {
            engine.record_sample(raw, now);
        }
        EngineEvent::SetPaused(paused) => engine.set_paused(paused, now),
        EngineEvent::ForceUpdate { steps, day } => {
            engine.force_update(steps, day, now);
        }
        EngineEvent::Import { csv, reply } => {
            let report = engine.import_csv(&csv, now);
            let _ = reply.send(report);
        }
        EngineEvent::Snapshot(reply) => {
            engine.ensure_current_day(now);
            let _ = reply.send(engine.snapshot());
        }
        EngineEvent::Stats(reply) => {
            let _ = reply.send(engine.stats());
        }
        EngineEvent::Flush => {
            engine.flush_all(now);
        }
        EngineEvent::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::FixedOffsetDays;
    use crate::config::EngineConfig;
    use crate::store::{DurableStore, MemoryDurableStore};
    use crate::surfaces::{ChannelSurface, SurfaceEvent};
    use std::time::Duration as StdDuration;

    fn engine_with(durable: Arc<dyn crate::store::DurableStore>, surface: Option<ChannelSurface>) -> StepEngine {
        let config = EngineConfig {
            debounce_ms: 50,
            ..EngineConfig::default()
        };
        let mut builder = StepEngine::builder(config)
            .durable_store(durable)
            .day_resolver(Arc::new(FixedOffsetDays::utc()));
        if let Some(surface) = surface {
            builder = builder.surface(Arc::new(surface));
        }
        builder.build(Utc::now()).unwrap()
    }

    #[test]
    fn test_samples_processed_in_order() {
        let durable = MemoryDurableStore::new();
        let service = EngineService::spawn(engine_with(Arc::new(durable.clone()), None)).unwrap();
        let handle = service.handle();

        for raw in [1_000, 1_010, 1_030, 5, 25] {
            handle.record_sample(raw).unwrap();
        }
        let snapshot = handle.snapshot().unwrap();
        assert_eq!(snapshot.steps, 50);

        let engine = service.shutdown().unwrap();
        assert_eq!(engine.today_steps(), 50);
        assert_eq!(durable.get(engine.current_day()).unwrap(), Some(50));
    }

    #[test]
    fn test_trailing_refresh_fires_on_wall_clock() {
        let (tx, rx) = channel::unbounded();
        let engine = engine_with(Arc::new(MemoryDurableStore::new()), Some(ChannelSurface::new(tx)));
        let service = EngineService::spawn(engine).unwrap();
        let handle = service.handle();

        handle.record_sample(10).unwrap();
        handle.record_sample(17).unwrap();
        // First sample publishes immediately
        assert!(matches!(
            rx.recv_timeout(StdDuration::from_secs(2)),
            Ok(SurfaceEvent::Snapshot(s)) if s.steps == 0
        ));
        // The trailing refresh carries the final total
        assert!(matches!(
            rx.recv_timeout(StdDuration::from_secs(2)),
            Ok(SurfaceEvent::Snapshot(s)) if s.steps == 7
        ));

        service.shutdown().unwrap();
    }

    #[test]
    fn test_import_and_stats_round_trip_through_queue() {
        let service = EngineService::spawn(engine_with(Arc::new(MemoryDurableStore::new()), None)).unwrap();
        let handle = service.handle();

        let report = handle.import_csv("2020-05-01,1000\nnope\n").unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(report.failed, 1);

        handle.record_sample(1).unwrap();
        assert_eq!(handle.stats().unwrap().samples, 1);
        service.shutdown().unwrap();
    }

    #[test]
    fn test_offloaded_store_behind_service() {
        let memory = MemoryDurableStore::new();
        let offloaded = Arc::new(OffloadedDurableStore::spawn(Arc::new(memory.clone())).unwrap());
        let service = EngineService::spawn(engine_with(offloaded.clone(), None)).unwrap();
        let handle = service.handle();

        handle.record_sample(100).unwrap();
        handle.record_sample(160).unwrap();
        let engine = service.shutdown().unwrap();

        offloaded.sync().unwrap();
        assert_eq!(memory.get(engine.current_day()).unwrap(), Some(60));
    }

    #[test]
    fn test_handle_errors_after_shutdown() {
        let service = EngineService::spawn(engine_with(Arc::new(MemoryDurableStore::new()), None)).unwrap();
        let handle = service.handle();
        service.shutdown().unwrap();
        assert!(matches!(handle.record_sample(1), Err(EngineError::ServiceStopped)));
    }
}
