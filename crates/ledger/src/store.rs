//! State persistence backends and the single-writer lock

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;

use crate::error::{Error, Result};
use crate::types::State;

/// Storage backend for [`State`]
///
/// Implementations must make `save` atomic: a crash part-way through a save
/// leaves the previously saved state visible to the next `load`.
pub trait StateStore: Send + Sync {
    /// Load the current state, or an empty state if nothing was saved yet
    fn load(&self) -> Result<State>;

    /// Replace the saved state
    fn save(&self, state: &State) -> Result<()>;

    /// Acquire the single-writer lock for the duration of a run
    fn lock(&self) -> Result<StateLock>;

    /// Human-readable location for messages
    fn location(&self) -> String;
}

/// Guard for the single-writer lock; released on drop
#[derive(Debug)]
pub struct StateLock {
    inner: LockInner,
}

#[derive(Debug)]
enum LockInner {
    File(PathBuf),
    Flag(Arc<AtomicBool>),
}

impl Drop for StateLock {
    fn drop(&mut self) {
        match &self.inner {
            LockInner::File(path) => {
                if let Err(e) = fs::remove_file(path) {
                    log::warn!("Failed to release lock {}: {}", path.display(), e);
                } else {
                    log::debug!("Released lock {}", path.display());
                }
            }
            LockInner::Flag(flag) => flag.store(false, Ordering::SeqCst),
        }
    }
}

// ============================================================================
// FileStore
// ============================================================================

/// JSON state file with write-temp-then-rename saves
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the lock file guarding this state
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Remove a stale lock left behind by a crashed run
    pub fn force_unlock(&self) -> Result<bool> {
        match fs::remove_file(self.lock_path()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

impl StateStore for FileStore {
    fn load(&self) -> Result<State> {
        if !self.path.exists() {
            log::debug!("State file {} does not exist, using empty state", self.path.display());
            return Ok(State::default());
        }

        let content = fs::read_to_string(&self.path)?;
        let state: State = serde_json::from_str(&content).map_err(|e| Error::Corrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        state.validate(&self.path)?;

        log::debug!(
            "Loaded state serial {} ({} records) from {}",
            state.serial,
            state.len(),
            self.path.display()
        );
        Ok(state)
    }

    fn save(&self, state: &State) -> Result<()> {
        let dir = self.parent_dir();
        fs::create_dir_all(&dir)?;

        // The temp file lives next to the target so the rename stays on one filesystem
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, state).map_err(Error::Serialize)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Persist {
            path: self.path.clone(),
            source: e.error,
        })?;

        log::debug!("Saved state serial {} to {}", state.serial, self.path.display());
        Ok(())
    }

    fn lock(&self) -> Result<StateLock> {
        fs::create_dir_all(self.parent_dir())?;
        let lock_path = self.lock_path();

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&lock_path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown holder".to_string());
                return Err(Error::Locked {
                    path: lock_path,
                    holder,
                });
            }
            Err(e) => return Err(e.into()),
        };

        writeln!(
            file,
            "pid {} since {}",
            std::process::id(),
            Utc::now().to_rfc3339()
        )?;

        log::debug!("Acquired lock {}", lock_path.display());
        Ok(StateLock {
            inner: LockInner::File(lock_path),
        })
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-process store, used by tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    locked: Arc<AtomicBool>,
    saves: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing state
    pub fn with_state(state: State) -> Self {
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    /// Number of successful saves so far
    pub fn saves(&self) -> u64 {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<State> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, state: &State) -> Result<()> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state.clone();
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }

    fn lock(&self) -> Result<StateLock> {
        if self.locked.swap(true, Ordering::SeqCst) {
            return Err(Error::Locked {
                path: PathBuf::from("<memory>"),
                holder: "another session".to_string(),
            });
        }
        Ok(StateLock {
            inner: LockInner::Flag(Arc::clone(&self.locked)),
        })
    }

    fn location(&self) -> String {
        "<memory>".to_string()
    }
}
