//! Checkpoint slots.
//!
//! A [`PositionStore`] holds exactly one [`Checkpoint`]. Writes must be
//! atomic with respect to a process crash: a reader of the slot sees either
//! the previous checkpoint or the new one, never a torn value.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use binwatch_core::types::Checkpoint;
use tracing::debug;

use crate::error::StoreError;

/// Single read/write checkpoint slot.
pub trait PositionStore: Send + Sync {
    /// Last saved checkpoint, `None` on a cold start.
    fn load(&self) -> Result<Option<Checkpoint>, StoreError>;

    /// Replace the slot.
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;
}

/// JSON checkpoint file, replaced atomically.
#[derive(Debug, Clone)]
pub struct FilePositionStore {
    path: PathBuf,
}

impl FilePositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl PositionStore for FilePositionStore {
    fn load(&self) -> Result<Option<Checkpoint>, StoreError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        let checkpoint = serde_json::from_slice(&raw).map_err(|e| {
            StoreError::Corrupt(format!("{}: {e}", self.path.display()))
        })?;
        Ok(Some(checkpoint))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let tmp = self.temp_path();
        let body = serde_json::to_vec_pretty(checkpoint)?;

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| StoreError::io(&tmp, e))?;
            file.write_all(&body).map_err(|e| StoreError::io(&tmp, e))?;
            file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))?;

        // persist the rename itself
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| StoreError::io(dir, e))?;

        debug!(path = %self.path.display(), position = %checkpoint.position, "checkpoint file written");
        Ok(())
    }
}
