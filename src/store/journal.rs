//! File-backed durable store
//!
//! Records are appended to a JSON-lines journal, one `DailyStepRecord` per
//! line. Replaying the journal with last-write-wins gives upsert semantics.
//! When superseded lines pile up the journal is rewritten atomically.

use super::{lock, DurableStore};
use crate::error::EngineError;
use crate::types::{CalendarDay, DailyStepRecord};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// Superseded lines tolerated before a compaction
const COMPACT_SLACK: usize = 256;

#[derive(Debug, Default)]
struct JournalState {
    records: BTreeMap<CalendarDay, u32>,
    lines: usize,
}

#[derive(Debug)]
pub struct JournalStore {
    path: PathBuf,
    state: Mutex<JournalState>,
}

impl JournalStore {
    /// Open (or create) the journal at `path` and replay it
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut state = JournalState::default();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (line_num, line) in reader.lines().enumerate() {
                let line = line?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<DailyStepRecord>(trimmed) {
                    Ok(record) => {
                        state.records.insert(record.day, record.steps);
                        state.lines += 1;
                    }
                    Err(e) => {
                        // A torn final write leaves a partial line behind
                        tracing::warn!(
                            path = %path.display(),
                            line = line_num + 1,
                            error = %e,
                            "skipping unreadable journal line"
                        );
                    }
                }
            }
        }

        tracing::debug!(
            path = %path.display(),
            days = state.records.len(),
            lines = state.lines,
            "journal opened"
        );

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the journal with exactly one line per day
    pub fn compact(&self) -> Result<(), EngineError> {
        let mut state = lock(&self.state)?;
        self.rewrite(&mut state)
    }

    fn rewrite(&self, state: &mut JournalState) -> Result<(), EngineError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut temp = NamedTempFile::new_in(&dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            for (day, steps) in &state.records {
                serde_json::to_writer(&mut writer, &DailyStepRecord::new(*day, *steps))?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| EngineError::Io(e.error))?;
        state.lines = state.records.len();
        tracing::debug!(path = %self.path.display(), days = state.lines, "journal compacted");
        Ok(())
    }
}

impl DurableStore for JournalStore {
    fn upsert(&self, record: DailyStepRecord) -> Result<(), EngineError> {
        let mut state = lock(&self.state)?;

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&line)?;
        file.sync_data()?;

        state.records.insert(record.day, record.steps);
        state.lines += 1;

        if state.lines > state.records.len() * 2 + COMPACT_SLACK {
            self.rewrite(&mut state)?;
        }
        Ok(())
    }

    fn get(&self, day: CalendarDay) -> Result<Option<u32>, EngineError> {
        Ok(lock(&self.state)?.records.get(&day).copied())
    }

    fn records(&self, from: CalendarDay, to: CalendarDay) -> Result<Vec<DailyStepRecord>, EngineError> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(lock(&self.state)?
            .records
            .range(from..=to)
            .map(|(day, steps)| DailyStepRecord::new(*day, *steps))
            .collect())
    }

    fn min_day(&self) -> Result<Option<CalendarDay>, EngineError> {
        Ok(lock(&self.state)?.records.keys().next().copied())
    }

    fn max_day(&self) -> Result<Option<CalendarDay>, EngineError> {
        Ok(lock(&self.state)?.records.keys().next_back().copied())
    }
}
