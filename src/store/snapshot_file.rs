//! File-backed fast persistence
//!
//! A single small JSON document replaced atomically (temp file + rename) on
//! every write, so a crash leaves either the old or the new snapshot.

use super::FastPersistence;
use crate::error::EngineError;
use crate::types::FastSnapshot;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FastPersistence for SnapshotFile {
    fn get(&self) -> Result<Option<FastSnapshot>, EngineError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn set(&self, snapshot: FastSnapshot) -> Result<(), EngineError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer(temp.as_file_mut(), &snapshot)?;
        temp.as_file_mut().flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| EngineError::Io(e.error))?;
        Ok(())
    }
}
