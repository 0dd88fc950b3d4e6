//! Durable checkpoint store.
//!
//! Persists the last fully-processed block number as a small JSON file.
//! Writes go to a temp file first and are renamed into place, so the file
//! never holds a partially written value.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::CheckpointError;

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointState {
    last_processed_block: u64,
}

/// Thread-safe checkpoint store. A single mutex guards both the cached
/// value and the file; no lock is held across await points (all IO is
/// synchronous and short).
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    last: Mutex<u64>,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            last: Mutex::new(0),
        }
    }

    /// Loads the persisted checkpoint. A missing file is not an error and
    /// yields 0 (never processed).
    pub fn load(&self) -> Result<u64, CheckpointError> {
        let mut last = self.last.lock().expect("checkpoint lock poisoned");
        let contents = match std::fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let state: CheckpointState = serde_json::from_slice(&contents)?;
        *last = state.last_processed_block;
        Ok(*last)
    }

    /// Atomically persists `block` as the new checkpoint.
    pub fn save(&self, block: u64) -> Result<(), CheckpointError> {
        let mut last = self.last.lock().expect("checkpoint lock poisoned");
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let body = serde_json::to_vec_pretty(&CheckpointState {
            last_processed_block: block,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &body)?;
        std::fs::rename(&tmp, &self.path)?;
        *last = block;
        debug!(target: "checkpoint", block, "checkpoint persisted");
        Ok(())
    }

    pub fn last(&self) -> u64 {
        *self.last.lock().expect("checkpoint lock poisoned")
    }
}
