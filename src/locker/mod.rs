//! Persisted, advisory, per-stage locks.
//!
//! Each held stage has a JSON marker in `<repo>/.stagehand/locks/<stage>.lock`
//! naming the orchestrator instance that owns it. Marker creation and removal
//! happen under an exclusive `fs2` lock on a guard file, so two orchestrator
//! processes sharing a repository cannot both claim a stage.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::config::state_dir;
use crate::errors::LockError;

const LOCKS_DIR: &str = "locks";
const GUARD_FILE: &str = ".guard";
const MARKER_EXT: &str = "lock";

/// Contents of a lock marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub instance_id: Uuid,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "instance {} (pid {}) since {}",
            self.instance_id,
            self.pid,
            self.acquired_at.to_rfc3339()
        )
    }
}

/// Lock table for one orchestrator instance.
#[derive(Debug)]
pub struct Locker {
    dir: PathBuf,
    instance_id: Uuid,
    held: Mutex<BTreeSet<String>>,
}

impl Locker {
    /// Locker rooted at `<repo>/.stagehand/locks` with a fresh instance id.
    pub fn for_repo(repo_path: &Path) -> Self {
        Self::new(state_dir(repo_path).join(LOCKS_DIR), Uuid::new_v4())
    }

    pub fn new(dir: PathBuf, instance_id: Uuid) -> Self {
        Self {
            dir,
            instance_id,
            held: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    fn marker_path(&self, stage_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", stage_id, MARKER_EXT))
    }

    /// Take the cross-process guard. Released when the returned file drops.
    fn guard(&self) -> Result<File, LockError> {
        let io_err = |source| LockError::Io {
            path: self.dir.clone(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let path = self.dir.join(GUARD_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        file.lock_exclusive()
            .map_err(|source| LockError::Io { path, source })?;
        Ok(file)
    }

    fn read_marker(&self, stage_id: &str) -> Result<Option<LockOwner>, LockError> {
        let path = self.marker_path(stage_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(LockError::Io { path, source }),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| LockError::CorruptMarker {
                stage_id: stage_id.to_string(),
                message: e.to_string(),
            })
    }

    /// Acquire the lock for `stage_id`. A no-op when this instance already
    /// holds it; [`LockError::HeldByOther`] when another instance does.
    pub fn acquire(&self, stage_id: &str) -> Result<(), LockError> {
        let _guard = self.guard()?;

        if let Some(owner) = self.read_marker(stage_id)? {
            if owner.instance_id == self.instance_id {
                return Ok(());
            }
            return Err(LockError::HeldByOther {
                stage_id: stage_id.to_string(),
                owner: owner.to_string(),
            });
        }

        let owner = LockOwner {
            instance_id: self.instance_id,
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let path = self.marker_path(stage_id);
        let payload = serde_json::to_vec_pretty(&owner).map_err(|e| LockError::CorruptMarker {
            stage_id: stage_id.to_string(),
            message: e.to_string(),
        })?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        if let Err(source) = file.write_all(&payload) {
            drop(file);
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(stage_id, error = %e, "Failed to remove partial lock marker");
            }
            return Err(LockError::Io { path, source });
        }

        self.held_set().insert(stage_id.to_string());
        tracing::debug!(stage_id, instance_id = %self.instance_id, "Acquired stage lock");
        Ok(())
    }

    /// Release the lock for `stage_id` if this instance owns it. Markers owned
    /// by other instances are left alone.
    pub fn release(&self, stage_id: &str) -> Result<(), LockError> {
        let _guard = self.guard()?;
        let was_held = self.held_set().remove(stage_id);

        match self.read_marker(stage_id) {
            Ok(Some(owner)) if owner.instance_id != self.instance_id => {
                tracing::warn!(stage_id, %owner, "Not releasing lock owned by another instance");
                return Ok(());
            }
            Ok(None) => return Ok(()),
            Ok(Some(_)) => {}
            // unreadable markers are only ours to remove if we wrote them
            Err(LockError::CorruptMarker { message, .. }) if !was_held => {
                tracing::warn!(
                    stage_id,
                    path = %self.marker_path(stage_id).display(),
                    error = %message,
                    "Leaving unreadable lock marker this instance does not hold"
                );
                return Ok(());
            }
            Err(LockError::CorruptMarker { .. }) => {}
            Err(e) => return Err(e),
        }

        let path = self.marker_path(stage_id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(LockError::Io { path, source }),
        }
        tracing::debug!(stage_id, "Released stage lock");
        Ok(())
    }

    /// Release every lock this instance holds. Returns how many were released;
    /// failures are logged and do not stop the sweep.
    pub fn release_all(&self) -> usize {
        let stages: Vec<String> = self.held_set().iter().cloned().collect();
        let mut released = 0;
        for stage_id in stages {
            match self.release(&stage_id) {
                Ok(()) => released += 1,
                Err(e) => tracing::warn!(stage_id = %stage_id, error = %e, "Failed to release lock"),
            }
        }
        released
    }

    /// Current owner of `stage_id`'s lock, if any.
    pub fn owner(&self, stage_id: &str) -> Result<Option<LockOwner>, LockError> {
        self.read_marker(stage_id)
    }

    pub fn is_held(&self, stage_id: &str) -> bool {
        self.held_set().contains(stage_id)
    }

    /// Stages locked by this instance, sorted.
    pub fn held(&self) -> Vec<String> {
        self.held_set().iter().cloned().collect()
    }

    fn held_set(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
