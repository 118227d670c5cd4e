//! Durable session state: `.tandem/state.json`.
//!
//! Writes go to a temporary file that is fsynced and renamed over the
//! snapshot, so the file on disk is always a complete earlier state. A
//! snapshot that does not parse is reported and left alone. One that parses
//! but fails validation is copied to `state.json.invalid` before the
//! controller records the failure over it.

use super::state::SessionState;
use crate::errors::StateError;
use crate::util::atomic_write;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Exclusive handle on a session's state file.
///
/// Holding a `StateStore` holds the workspace lock; it is released on drop.
#[derive(Debug)]
pub struct StateStore {
    state_file: PathBuf,
    lock_file: PathBuf,
    lock: File,
}

impl StateStore {
    /// Take the workspace lock. Fails with `StateError::Locked` while another
    /// controller holds it.
    pub fn open(state_file: &Path, lock_file: &Path) -> Result<Self, StateError> {
        if let Some(parent) = lock_file.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StateError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_file)
            .map_err(|source| StateError::Io {
                path: lock_file.to_path_buf(),
                source,
            })?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StateError::Locked(lock_file.to_path_buf()));
        }
        tracing::debug!(lock = %lock_file.display(), "Acquired session lock");
        Ok(Self {
            state_file: state_file.to_path_buf(),
            lock_file: lock_file.to_path_buf(),
            lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    pub fn exists(&self) -> bool {
        self.state_file.exists()
    }

    /// Read the snapshot without validating it.
    pub fn read(&self) -> Result<SessionState, StateError> {
        read_state(&self.state_file)
    }

    /// Copy the current snapshot aside for inspection. Returns the copy's
    /// path.
    pub fn preserve_invalid(&self) -> Result<PathBuf, StateError> {
        let target = invalid_copy_path(&self.state_file);
        std::fs::copy(&self.state_file, &target).map_err(|source| StateError::Io {
            path: target.clone(),
            source,
        })?;
        Ok(target)
    }

    /// Persist `state` atomically.
    pub fn save(&self, state: &SessionState) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| StateError::Validation(format!("state does not serialize: {}", e)))?;
        atomic_write(&self.state_file, &json).map_err(|source| StateError::Io {
            path: self.state_file.clone(),
            source,
        })?;
        tracing::debug!(
            iteration = state.iteration(),
            phase = %state.phase(),
            cursor = ?state.cursor,
            "State persisted"
        );
        Ok(())
    }

    /// Remove the snapshot so a fresh session can start.
    pub fn discard(&self) -> Result<(), StateError> {
        match std::fs::remove_file(&self.state_file) {
            Ok(()) => {
                tracing::info!(path = %self.state_file.display(), "Discarded previous session state");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Io {
                path: self.state_file.clone(),
                source,
            }),
        }
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock);
        tracing::debug!(lock = %self.lock_file.display(), "Released session lock");
    }
}

/// Where a snapshot that failed validation is kept.
pub fn invalid_copy_path(state_file: &Path) -> PathBuf {
    state_file.with_extension("json.invalid")
}

/// Read a snapshot without taking the lock or validating it, for read-only
/// commands such as `status`.
pub fn read_state(path: &Path) -> Result<SessionState, StateError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StateError::Missing(path.to_path_buf()));
        }
        Err(source) => {
            return Err(StateError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&content)
        .map_err(|e| StateError::Validation(format!("{} is not a session snapshot: {}", path.display(), e)))
}
