//! Background durable writes
//!
//! The engine decides what to write on its own thread; `OffloadedDurableStore`
//! moves the byte-level I/O to a worker so a slow disk never stalls sample
//! processing. Reads wait for queued writes first, so callers always see
//! their own writes.

use crate::error::EngineError;
use crate::store::{lock, DurableStore};
use crate::types::{CalendarDay, DailyStepRecord};
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

enum Job {
    Upsert(DailyStepRecord),
    Barrier(Sender<()>),
}

/// A [`DurableStore`] whose upserts are queued to a worker thread.
///
/// A failed write stays queued (latest value per day) and is retried ahead
/// of the next job.
pub struct OffloadedDurableStore {
    inner: Arc<dyn DurableStore>,
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    failures: Arc<AtomicU64>,
}

impl OffloadedDurableStore {
    pub fn spawn(inner: Arc<dyn DurableStore>) -> Result<Self, EngineError> {
        let (sender, receiver) = channel::unbounded();
        let failures = Arc::new(AtomicU64::new(0));

        let worker = {
            let inner = Arc::clone(&inner);
            let failures = Arc::clone(&failures);
            thread::Builder::new()
                .name("pace-writer".to_string())
                .spawn(move || run(inner, receiver, failures))?
        };

        Ok(Self {
            inner,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            failures,
        })
    }

    /// Block until every queued write has been attempted
    pub fn sync(&self) -> Result<(), EngineError> {
        let (reply, done) = channel::bounded(1);
        self.send(Job::Barrier(reply))?;
        done.recv().map_err(|_| EngineError::ServiceStopped)
    }

    /// Failed write attempts so far
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Drain the queue and stop the worker
    pub fn close(&self) -> Result<(), EngineError> {
        lock(&self.sender)?.take();
        if let Some(worker) = lock(&self.worker)?.take() {
            worker.join().map_err(|_| EngineError::ServiceStopped)?;
        }
        Ok(())
    }

    fn send(&self, job: Job) -> Result<(), EngineError> {
        lock(&self.sender)?
            .as_ref()
            .ok_or(EngineError::ServiceStopped)?
            .send(job)
            .map_err(|_| EngineError::ServiceStopped)
    }

    fn settle(&self) {
        if let Err(e) = self.sync() {
            tracing::debug!(error = %e, "write worker unavailable, reading store directly");
        }
    }
}

impl Drop for OffloadedDurableStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "write worker did not stop cleanly");
        }
    }
}

impl DurableStore for OffloadedDurableStore {
    fn upsert(&self, record: DailyStepRecord) -> Result<(), EngineError> {
        self.send(Job::Upsert(record))
    }

    fn get(&self, day: CalendarDay) -> Result<Option<u32>, EngineError> {
        self.settle();
        self.inner.get(day)
    }

    fn records(&self, from: CalendarDay, to: CalendarDay) -> Result<Vec<DailyStepRecord>, EngineError> {
        self.settle();
        self.inner.records(from, to)
    }

    fn min_day(&self) -> Result<Option<CalendarDay>, EngineError> {
        self.settle();
        self.inner.min_day()
    }

    fn max_day(&self) -> Result<Option<CalendarDay>, EngineError> {
        self.settle();
        self.inner.max_day()
    }
}

fn run(inner: Arc<dyn DurableStore>, jobs: Receiver<Job>, failures: Arc<AtomicU64>) {
    let mut queued: BTreeMap<CalendarDay, u32> = BTreeMap::new();

    for job in jobs {
        match job {
            Job::Upsert(record) => {
                queued.insert(record.day, record.steps);
                write_queued(inner.as_ref(), &mut queued, &failures);
            }
            Job::Barrier(reply) => {
                write_queued(inner.as_ref(), &mut queued, &failures);
                let _ = reply.send(());
            }
        }
    }

    write_queued(inner.as_ref(), &mut queued, &failures);
    if !queued.is_empty() {
        tracing::warn!(days = queued.len(), "write worker stopped with unwritten records");
    }
}

fn write_queued(store: &dyn DurableStore, queued: &mut BTreeMap<CalendarDay, u32>, failures: &AtomicU64) {
    queued.retain(|day, steps| match store.upsert(DailyStepRecord::new(*day, *steps)) {
        Ok(()) => false,
        Err(e) => {
            failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(day = %day, steps = *steps, error = %e, "background durable write failed");
            true
        }
    });
}
