//! Durable key-value store for per-stage state
//!
//! [`StateDb`] keeps every value in memory and mirrors the whole map to a
//! pretty-printed JSON document. `set` updates memory immediately (so a later
//! `get` always sees it) and queues a flush job; the owning thread writes the
//! file when it pumps [`StateDb::process_messages`]. Stages on other threads
//! therefore never touch the file and need no locking of their own.
//!
//! # File Layout
//!
//! ```json
//! {
//!   "saved_at": "2026-01-01T12:00:00+00:00",
//!   "entries": {
//!     "stage/face_detector/state": { "threshold": 0.5 },
//!     "stage/face_detector/on_off": true
//!   }
//! }
//! ```
//!
//! Writes go to a temporary file which is then renamed over the target.
//! I/O failures are logged and the in-memory state stays authoritative.

use crate::error::{FaceliveError, Result};
use crossbeam_channel::{Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// State file name inside the user data directory.
pub const STATE_FILE: &str = "states.json";

/// Marker trait for a stage's persisted attribute struct.
///
/// Fields are usually `Option<_>` so that "never touched" survives a round
/// trip and the documented default is applied at the point of use.
pub trait WorkerState:
    Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
}

impl<T> WorkerState for T where
    T: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
}

/// Key under which a stage's worker state is stored.
pub fn state_key(stage: &str) -> String {
    format!("stage/{}/state", stage)
}

/// Key under which a stage's on/off flag is stored.
pub fn on_off_key(stage: &str) -> String {
    format!("stage/{}/on_off", stage)
}

#[derive(Serialize, Deserialize, Default)]
struct StateFile {
    #[serde(default)]
    saved_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    entries: BTreeMap<String, serde_json::Value>,
}

enum StateJob {
    Flush,
}

struct StateDbInner {
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, serde_json::Value>>,
    jobs_tx: Sender<StateJob>,
    jobs_rx: Receiver<StateJob>,
    dirty: AtomicBool,
    flushes: AtomicU64,
}

/// Cloneable handle to the shared store.
#[derive(Clone)]
pub struct StateDb {
    inner: Arc<StateDbInner>,
}

impl StateDb {
    fn with_entries(path: Option<PathBuf>, entries: BTreeMap<String, serde_json::Value>) -> Self {
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        Self {
            inner: Arc::new(StateDbInner {
                path,
                entries: RwLock::new(entries),
                jobs_tx,
                jobs_rx,
                dirty: AtomicBool::new(false),
                flushes: AtomicU64::new(0),
            }),
        }
    }

    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self::with_entries(None, BTreeMap::new())
    }

    /// Open (or create on first flush) the store at `path`.
    ///
    /// An unreadable or corrupt file is logged and treated as empty.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match Self::read_file(&path) {
            Ok(file) => file.entries,
            Err(e) => {
                tracing::warn!(
                    "Failed to load state database {:?}, starting empty: {}",
                    path,
                    e
                );
                BTreeMap::new()
            }
        };
        tracing::debug!("State database {:?} opened with {} entries", path, entries.len());
        Self::with_entries(Some(path), entries)
    }

    fn read_file(path: &Path) -> Result<StateFile> {
        if !path.exists() {
            return Ok(StateFile::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| FaceliveError::State(format!("Failed to read {:?}: {}", path, e)))?;
        serde_json::from_str(&content)
            .map_err(|e| FaceliveError::State(format!("Failed to parse {:?}: {}", path, e)))
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    fn read_entries(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, serde_json::Value>> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_entries(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, serde_json::Value>> {
        self.inner
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read and deserialize `key`. A value of the wrong shape reads as `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.read_entries().get(key).cloned()?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("State entry '{}' has unexpected shape: {}", key, e);
                None
            }
        }
    }

    /// Store `value` under `key` and queue a flush.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.write_entries().insert(key.to_string(), value);
        self.mark_dirty();
        Ok(())
    }

    pub fn remove(&self, key: &str) -> bool {
        let removed = self.write_entries().remove(key).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read_entries().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.read_entries().keys().cloned().collect()
    }

    fn mark_dirty(&self) {
        self.inner.dirty.store(true, Ordering::Release);
        // The receiver lives in `inner`, so this cannot disconnect.
        let _ = self.inner.jobs_tx.send(StateJob::Flush);
    }

    /// Whether there are changes not yet written.
    pub fn has_pending_jobs(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    /// Number of successful file writes.
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::Relaxed)
    }

    /// Drain queued jobs and write once if anything changed.
    ///
    /// Changes left over from a failed write are retried here too.
    pub fn process_messages(&self) {
        let mut pending = false;
        for job in self.inner.jobs_rx.try_iter() {
            match job {
                StateJob::Flush => pending = true,
            }
        }
        if pending || self.has_pending_jobs() {
            self.flush();
        }
    }

    /// Write everything now, regardless of queued jobs.
    pub fn finish_pending_jobs(&self) {
        for _ in self.inner.jobs_rx.try_iter() {}
        self.flush();
    }

    fn flush(&self) {
        if !self.inner.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(path) = self.inner.path.as_deref() else {
            return;
        };
        if let Err(e) = self.write_file(path) {
            tracing::warn!("Failed to save state database: {}", e);
            // Retry on the next pump.
            self.inner.dirty.store(true, Ordering::Release);
        } else {
            self.inner.flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn write_file(&self, path: &Path) -> Result<()> {
        let file = StateFile {
            saved_at: Some(chrono::Utc::now()),
            entries: self.read_entries().clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl std::fmt::Debug for StateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDb")
            .field("path", &self.inner.path)
            .field("entries", &self.read_entries().len())
            .field("dirty", &self.has_pending_jobs())
            .finish()
    }
}
