/// Scheduled connections
///
/// A connection is something that can be synced on a schedule: the sync
/// produces a trigger file and names the pipelines to run on it. The ticker
/// only talks to the `ConnectionCatalog` trait; `FileDropCatalog` is the
/// built-in implementation, where syncing means copying a dropped JSON file
/// into a staging directory.
///
/// `connections.json`:
/// ```json
/// [{ "id": "shop-orders", "schedule": "*/15 * * * *",
///    "inputPath": "/srv/drop/orders.json", "pipelineIds": ["orders-to-warehouse"],
///    "debug": false }]
/// ```

use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// What the ticker needs to decide whether a connection is due
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledConnection {
    pub id: String,
    pub schedule: String,
    /// Last successful sync
    pub last_run_at: Option<DateTime<Utc>>,
    pub debug: bool,
}

/// Result of one sync
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub trigger_file: PathBuf,
    pub pipeline_ids: Vec<String>,
}

#[async_trait]
pub trait ConnectionCatalog: Send + Sync {
    async fn scheduled(&self) -> PipelineResult<Vec<ScheduledConnection>>;

    async fn sync(&self, connection: &ScheduledConnection) -> PipelineResult<SyncOutcome>;

    async fn mark_synced(&self, connection_id: &str, at: DateTime<Utc>) -> PipelineResult<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEntry {
    pub id: String,
    pub schedule: String,
    pub input_path: PathBuf,
    #[serde(default)]
    pub pipeline_ids: Vec<String>,
    #[serde(default)]
    pub debug: bool,
}

/// File-drop connections read from a JSON file
#[derive(Debug)]
pub struct FileDropCatalog {
    entries: Vec<ConnectionEntry>,
    staging_dir: PathBuf,
    last_runs: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl FileDropCatalog {
    pub fn new(entries: Vec<ConnectionEntry>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            entries,
            staging_dir: staging_dir.into(),
            last_runs: RwLock::new(HashMap::new()),
        }
    }

    /// Load `path`; a missing file means no scheduled connections
    pub async fn load(path: &Path, staging_dir: impl Into<PathBuf>) -> PipelineResult<Self> {
        let entries = match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice::<Vec<ConnectionEntry>>(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("📭 No connection file at {}, nothing is scheduled", path.display());
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!("📋 Loaded {} scheduled connections", entries.len());
        Ok(Self::new(entries, staging_dir))
    }

    fn entry(&self, id: &str) -> PipelineResult<&ConnectionEntry> {
        self.entries
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| PipelineError::NotFound(format!("connection '{}'", id)))
    }
}

#[async_trait]
impl ConnectionCatalog for FileDropCatalog {
    async fn scheduled(&self) -> PipelineResult<Vec<ScheduledConnection>> {
        let last_runs = self.last_runs.read().await;
        Ok(self
            .entries
            .iter()
            .map(|entry| ScheduledConnection {
                id: entry.id.clone(),
                schedule: entry.schedule.clone(),
                last_run_at: last_runs.get(&entry.id).copied(),
                debug: entry.debug,
            })
            .collect())
    }

    async fn sync(&self, connection: &ScheduledConnection) -> PipelineResult<SyncOutcome> {
        let entry = self.entry(&connection.id)?;
        if tokio::fs::metadata(&entry.input_path).await.is_err() {
            return Err(PipelineError::NotFound(format!(
                "connection '{}' input {} does not exist",
                entry.id,
                entry.input_path.display()
            )));
        }

        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let trigger_file = self.staging_dir.join(format!(
            "{}-{}.json",
            entry.id,
            Utc::now().format("%Y%m%dT%H%M%S%.3f")
        ));
        tokio::fs::copy(&entry.input_path, &trigger_file).await?;
        tracing::info!("🔄 Synced connection {} into {}", entry.id, trigger_file.display());

        Ok(SyncOutcome {
            trigger_file,
            pipeline_ids: entry.pipeline_ids.clone(),
        })
    }

    async fn mark_synced(&self, connection_id: &str, at: DateTime<Utc>) -> PipelineResult<()> {
        self.entry(connection_id)?;
        self.last_runs.write().await.insert(connection_id.to_string(), at);
        Ok(())
    }
}
