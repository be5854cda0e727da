//! Deployment history.
//!
//! History is append-only. The most recent record with status `Success`
//! for an environment is the rollback target; failed and rolled-back
//! runs never replace it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flotilla_core::{is_valid_environment_name, DeploymentRecord, DeploymentStatus};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::{OrchestratorError, Result};

/// Storage for deployment records.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Appends a finished record.
    async fn append(&self, record: &DeploymentRecord) -> Result<()>;

    /// Returns every record for `environment`, oldest first.
    async fn records(&self, environment: &str) -> Result<Vec<DeploymentRecord>>;

    /// Returns the most recent successful record.
    async fn last_success(&self, environment: &str) -> Result<Option<DeploymentRecord>> {
        Ok(self
            .records(environment)
            .await?
            .into_iter()
            .rev()
            .find(|r| r.status == DeploymentStatus::Success))
    }

    /// Returns the most recent record of any status.
    async fn latest(&self, environment: &str) -> Result<Option<DeploymentRecord>> {
        Ok(self.records(environment).await?.pop())
    }
}

/// History kept in process memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryHistory {
    records: Arc<RwLock<HashMap<String, Vec<DeploymentRecord>>>>,
}

impl InMemoryHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a history pre-populated with `records`.
    pub fn with_records(records: impl IntoIterator<Item = DeploymentRecord>) -> Self {
        let mut map: HashMap<String, Vec<DeploymentRecord>> = HashMap::new();
        for record in records {
            map.entry(record.environment.clone()).or_default().push(record);
        }
        Self {
            records: Arc::new(RwLock::new(map)),
        }
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn append(&self, record: &DeploymentRecord) -> Result<()> {
        self.records
            .write()
            .await
            .entry(record.environment.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn records(&self, environment: &str) -> Result<Vec<DeploymentRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(environment)
            .cloned()
            .unwrap_or_default())
    }
}

/// History stored as one JSON-lines file per environment.
///
/// Records live at `<state-dir>/history/<environment>.jsonl`.
#[derive(Debug, Clone)]
pub struct FileHistory {
    dir: PathBuf,
}

impl FileHistory {
    /// Creates a store rooted at `state_dir`.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: state_dir.as_ref().join("history"),
        }
    }

    /// Returns the file holding `environment`'s records.
    pub fn path_for(&self, environment: &str) -> Result<PathBuf> {
        if !is_valid_environment_name(environment) {
            return Err(OrchestratorError::History(format!(
                "invalid environment name '{environment}'"
            )));
        }
        Ok(self.dir.join(format!("{environment}.jsonl")))
    }
}

#[async_trait]
impl HistoryStore for FileHistory {
    async fn append(&self, record: &DeploymentRecord) -> Result<()> {
        let path = self.path_for(&record.environment)?;
        let io_err = |e: std::io::Error| {
            OrchestratorError::History(format!("cannot write {}: {e}", path.display()))
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let mut line = serde_json::to_string(record)
            .map_err(|e| OrchestratorError::History(e.to_string()))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).await.map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;

        tracing::debug!(
            environment = %record.environment,
            deployment_id = %record.id,
            status = %record.status,
            "appended deployment record"
        );
        Ok(())
    }

    async fn records(&self, environment: &str) -> Result<Vec<DeploymentRecord>> {
        let path = self.path_for(environment)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(OrchestratorError::History(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| {
                    OrchestratorError::History(format!("{}:{}: {e}", path.display(), i + 1))
                })
            })
            .collect()
    }
}
