//! Persistence collaborators
//!
//! Two tiers sit behind the engine:
//!
//! - **DurableStore**: authoritative day-indexed history, one record per day
//!   (upsert semantics).
//! - **FastPersistence**: a single low-latency mirror of today's running total,
//!   read back only on restart.
//!
//! In-memory implementations live here; file-backed ones in [`journal`] and
//! [`snapshot_file`].

pub mod journal;
pub mod snapshot_file;

pub use journal::JournalStore;
pub use snapshot_file::SnapshotFile;

use crate::error::EngineError;
use crate::types::{CalendarDay, DailyStepRecord, FastSnapshot};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Journal file name inside a state directory
pub const HISTORY_FILE: &str = "history.jsonl";
/// Fast mirror file name inside a state directory
pub const TODAY_FILE: &str = "today.json";

/// Open the file-backed stores kept under `dir`
pub fn open_state_dir(dir: impl AsRef<Path>) -> Result<(JournalStore, SnapshotFile), EngineError> {
    let dir = dir.as_ref();
    let journal = JournalStore::open(dir.join(HISTORY_FILE))?;
    let snapshot = SnapshotFile::new(dir.join(TODAY_FILE))?;
    Ok((journal, snapshot))
}

/// Day-indexed history of step totals
pub trait DurableStore: Send + Sync {
    /// Insert or replace the record for `record.day`
    fn upsert(&self, record: DailyStepRecord) -> Result<(), EngineError>;

    fn get(&self, day: CalendarDay) -> Result<Option<u32>, EngineError>;

    /// Records with `from <= day <= to`, ordered by day
    fn records(&self, from: CalendarDay, to: CalendarDay) -> Result<Vec<DailyStepRecord>, EngineError>;

    fn min_day(&self) -> Result<Option<CalendarDay>, EngineError>;

    fn max_day(&self) -> Result<Option<CalendarDay>, EngineError>;

    /// Total steps over the inclusive range
    fn sum(&self, from: CalendarDay, to: CalendarDay) -> Result<u64, EngineError> {
        Ok(self
            .records(from, to)?
            .iter()
            .map(|r| u64::from(r.steps))
            .sum())
    }

    /// Mean steps per recorded day over the inclusive range, truncated; 0 when empty
    fn average(&self, from: CalendarDay, to: CalendarDay) -> Result<u32, EngineError> {
        let records = self.records(from, to)?;
        if records.is_empty() {
            return Ok(0);
        }
        let total: u64 = records.iter().map(|r| u64::from(r.steps)).sum();
        Ok((total / records.len() as u64) as u32)
    }
}

/// Low-latency mirror of the current day's running total
pub trait FastPersistence: Send + Sync {
    fn get(&self) -> Result<Option<FastSnapshot>, EngineError>;

    fn set(&self, snapshot: FastSnapshot) -> Result<(), EngineError>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, EngineError> {
    mutex
        .lock()
        .map_err(|_| EngineError::Store("store lock poisoned".to_string()))
}

/// In-memory durable store.
///
/// Clones share the same records. Every successful upsert is also appended
/// to a write log, and writes can be made to fail on demand.
#[derive(Debug, Clone, Default)]
pub struct MemoryDurableStore {
    records: Arc<Mutex<BTreeMap<CalendarDay, u32>>>,
    write_log: Arc<Mutex<Vec<DailyStepRecord>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent upserts fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Every successful upsert, in order
    pub fn write_log(&self) -> Vec<DailyStepRecord> {
        self.write_log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Successful upserts for one day, in order
    pub fn writes_for(&self, day: CalendarDay) -> Vec<u32> {
        self.write_log()
            .into_iter()
            .filter(|r| r.day == day)
            .map(|r| r.steps)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableStore for MemoryDurableStore {
    fn upsert(&self, record: DailyStepRecord) -> Result<(), EngineError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(EngineError::Store("durable store unavailable".to_string()));
        }
        lock(&self.records)?.insert(record.day, record.steps);
        lock(&self.write_log)?.push(record);
        Ok(())
    }

    fn get(&self, day: CalendarDay) -> Result<Option<u32>, EngineError> {
        Ok(lock(&self.records)?.get(&day).copied())
    }

    fn records(&self, from: CalendarDay, to: CalendarDay) -> Result<Vec<DailyStepRecord>, EngineError> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(lock(&self.records)?
            .range(from..=to)
            .map(|(day, steps)| DailyStepRecord::new(*day, *steps))
            .collect())
    }

    fn min_day(&self) -> Result<Option<CalendarDay>, EngineError> {
        Ok(lock(&self.records)?.keys().next().copied())
    }

    fn max_day(&self) -> Result<Option<CalendarDay>, EngineError> {
        Ok(lock(&self.records)?.keys().next_back().copied())
    }
}

/// In-memory fast mirror; clones share the stored snapshot
#[derive(Debug, Clone, Default)]
pub struct MemoryFastPersistence {
    snapshot: Arc<Mutex<Option<FastSnapshot>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryFastPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: FastSnapshot) -> Self {
        Self {
            snapshot: Arc::new(Mutex::new(Some(snapshot))),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

impl FastPersistence for MemoryFastPersistence {
    fn get(&self) -> Result<Option<FastSnapshot>, EngineError> {
        Ok(lock(&self.snapshot)?.clone())
    }

    fn set(&self, snapshot: FastSnapshot) -> Result<(), EngineError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(EngineError::Store("fast persistence unavailable".to_string()));
        }
        *lock(&self.snapshot)? = Some(snapshot);
        Ok(())
    }
}
