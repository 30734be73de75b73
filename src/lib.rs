//! Pacekeeper - On-device step aggregation and debounced persistence
//!
//! Pacekeeper turns a cumulative hardware step counter into per-day step
//! totals: raw samples become deltas, deltas accumulate into the current
//! local day, and the running total is written back to a durable history,
//! a fast mirror and any display surfaces at bounded rates.
//!
//! ## Modules
//!
//! - **Engine**: [`StepEngine`] owns the state and every entry point
//! - **Stores**: durable history and the fast mirror, in memory or on disk
//! - **Service**: a single engine thread fed by a queue, plus background writes
//! - **Replay**: deterministic virtual-time replay of recorded events

pub mod accumulator;
pub mod calendar;
pub mod config;
pub mod day_boundary;
pub mod engine;
pub mod error;
pub mod goal;
pub mod import;
pub mod power;
pub mod replay;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod surfaces;
pub mod timer;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use calendar::{DayResolver, FixedOffsetDays, LocalDays};
pub use config::{DistanceUnit, EngineConfig};
pub use day_boundary::Rollover;
pub use engine::{EngineStats, SampleOutcome, StepEngine, StepEngineBuilder, TickOutcome};
pub use error::EngineError;
pub use import::ImportReport;
pub use power::{PowerModeSignal, PowerToggle};
pub use scheduler::{FlushPlan, WriteBackTimestamps};
pub use service::{EngineHandle, EngineService};
pub use store::{DurableStore, FastPersistence};
pub use surfaces::ExternalSurfaces;
pub use types::{CalendarDay, DailyStepRecord, FastSnapshot, Observation, StepSnapshot};

/// Pacekeeper version
pub const PACEKEEPER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by tooling
pub const PRODUCER_NAME: &str = "pacekeeper";
