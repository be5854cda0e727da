//! Per-environment mutual exclusion.
//!
//! At most one deploy or rollback runs against an environment at a time.
//! Runs in the same process are serialized through an in-memory table;
//! when a lock directory is configured, a `<dir>/<environment>.lock` file
//! created with `O_EXCL` also keeps separate processes apart.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flotilla_core::is_valid_environment_name;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Run holding the lock.
    pub deployment_id: Uuid,
    /// Process holding the lock.
    pub pid: u32,
    /// When the lock was taken.
    pub started_at: DateTime<Utc>,
}

impl std::fmt::Display for LockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "run {} (pid {}) since {}",
            self.deployment_id,
            self.pid,
            self.started_at.to_rfc3339()
        )
    }
}

/// A lock file removed when dropped.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Creates the lock file for `environment`, failing if it already exists.
    ///
    /// Uses blocking `std::fs` calls. They touch one small file and run
    /// once per deploy or rollback.
    pub fn acquire(dir: &Path, environment: &str, deployment_id: Uuid) -> Result<Self> {
        let path = lock_path(dir, environment)?;
        std::fs::create_dir_all(dir).map_err(|e| {
            OrchestratorError::Internal(format!("cannot create {}: {e}", dir.display()))
        })?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = Self::inspect(dir, environment).map_or_else(
                    || format!("lock file {} exists", path.display()),
                    |info| format!("{info}, lock file {}", path.display()),
                );
                return Err(OrchestratorError::DeploymentInProgress {
                    environment: environment.to_string(),
                    holder,
                });
            }
            Err(e) => {
                return Err(OrchestratorError::Internal(format!(
                    "cannot create {}: {e}",
                    path.display()
                )))
            }
        };

        let info = LockInfo {
            deployment_id,
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        let lock = Self { path };
        serde_json::to_writer(&mut file, &info)
            .map_err(std::io::Error::from)
            .and_then(|()| file.flush())
            .map_err(|e| {
                OrchestratorError::Internal(format!("cannot write {}: {e}", lock.path.display()))
            })?;
        Ok(lock)
    }

    /// Reads the current holder of `environment`'s lock, if any.
    pub fn inspect(dir: &Path, environment: &str) -> Option<LockInfo> {
        let content = std::fs::read_to_string(lock_path(dir, environment).ok()?).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Returns the lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}

fn lock_path(dir: &Path, environment: &str) -> Result<PathBuf> {
    if !is_valid_environment_name(environment) {
        return Err(OrchestratorError::Internal(format!(
            "invalid environment name '{environment}'"
        )));
    }
    Ok(dir.join(format!("{environment}.lock")))
}

/// Lock table shared by every run of an orchestrator.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentLocks {
    held: Arc<Mutex<HashMap<String, Uuid>>>,
    lock_dir: Option<PathBuf>,
}

impl EnvironmentLocks {
    /// Creates an in-process lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a lock table that also takes lock files in `dir`.
    pub fn with_lock_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            held: Arc::default(),
            lock_dir: Some(dir.into()),
        }
    }

    /// Takes the lock for `environment` on behalf of `deployment_id`.
    ///
    /// Fails with [`OrchestratorError::DeploymentInProgress`] when another
    /// run holds it. The lock is released when the guard is dropped.
    pub fn try_acquire(&self, environment: &str, deployment_id: Uuid) -> Result<EnvironmentGuard> {
        {
            let mut held = self.held.lock();
            if let Some(holder) = held.get(environment) {
                return Err(OrchestratorError::DeploymentInProgress {
                    environment: environment.to_string(),
                    holder: format!("run {holder}"),
                });
            }
            held.insert(environment.to_string(), deployment_id);
        }

        let file = match &self.lock_dir {
            Some(dir) => match LockFile::acquire(dir, environment, deployment_id) {
                Ok(file) => Some(file),
                Err(e) => {
                    self.held.lock().remove(environment);
                    return Err(e);
                }
            },
            None => None,
        };

        tracing::debug!(environment = %environment, deployment_id = %deployment_id, "environment lock acquired");
        Ok(EnvironmentGuard {
            environment: environment.to_string(),
            held: Arc::clone(&self.held),
            file,
        })
    }

    /// Describes the current holder of `environment`'s lock.
    pub fn holder(&self, environment: &str) -> Option<String> {
        if let Some(id) = self.held.lock().get(environment) {
            return Some(format!("run {id}"));
        }
        self.lock_dir
            .as_deref()
            .and_then(|dir| LockFile::inspect(dir, environment))
            .map(|info| info.to_string())
    }
}

/// Holds an environment lock until dropped.
#[derive(Debug)]
pub struct EnvironmentGuard {
    environment: String,
    held: Arc<Mutex<HashMap<String, Uuid>>>,
    file: Option<LockFile>,
}

impl EnvironmentGuard {
    /// Returns the locked environment.
    pub fn environment(&self) -> &str {
        &self.environment
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        drop(self.file.take());
        self.held.lock().remove(&self.environment);
        tracing::debug!(environment = %self.environment, "environment lock released");
    }
}
