/// Execution record persistence
///
/// The orchestrator is the single writer of a run's record and persists every
/// change as it happens, so a crash mid-run leaves a readable partial trail.
/// `MemoryExecutionStore` backs tests and embedded use; `SqliteExecutionStore`
/// keeps records across restarts with the log as an append-only table.

use crate::error::{PipelineError, PipelineResult};
use crate::execution::record::{ExecutionRecord, ExecutionStatus, LogEntry, LogLevel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create a RUNNING record with an empty log
    async fn create(&self, pipeline_id: &str) -> PipelineResult<ExecutionRecord>;

    async fn append_log(&self, execution_id: &str, entry: LogEntry) -> PipelineResult<()>;

    /// Set the output reference of one node
    async fn record_output(&self, execution_id: &str, node_id: &str, output: Value) -> PipelineResult<()>;

    /// Move a RUNNING record to a terminal status and stamp its completion time
    async fn finish(&self, execution_id: &str, status: ExecutionStatus) -> PipelineResult<()>;

    async fn get(&self, execution_id: &str) -> PipelineResult<Option<ExecutionRecord>>;
}

fn new_execution_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn unknown(execution_id: &str) -> PipelineError {
    PipelineError::Persistence(format!("execution '{}' does not exist", execution_id))
}

fn check_transition(execution_id: &str, current: ExecutionStatus, next: ExecutionStatus) -> PipelineResult<()> {
    if !next.is_terminal() {
        return Err(PipelineError::Persistence(format!(
            "execution '{}' can only finish as COMPLETED or FAILED",
            execution_id
        )));
    }
    if current.is_terminal() {
        return Err(PipelineError::Persistence(format!(
            "execution '{}' is already {}",
            execution_id,
            current.as_str()
        )));
    }
    Ok(())
}

/// In-process store keyed by execution id
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    records: RwLock<HashMap<String, ExecutionRecord>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<ExecutionRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create(&self, pipeline_id: &str) -> PipelineResult<ExecutionRecord> {
        let record = ExecutionRecord::start(new_execution_id(), pipeline_id);
        self.records.write().await.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn append_log(&self, execution_id: &str, entry: LogEntry) -> PipelineResult<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(execution_id).ok_or_else(|| unknown(execution_id))?;
        record.logs.push(entry);
        Ok(())
    }

    async fn record_output(&self, execution_id: &str, node_id: &str, output: Value) -> PipelineResult<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(execution_id).ok_or_else(|| unknown(execution_id))?;
        record.outputs.insert(node_id.to_string(), output);
        Ok(())
    }

    async fn finish(&self, execution_id: &str, status: ExecutionStatus) -> PipelineResult<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(execution_id).ok_or_else(|| unknown(execution_id))?;
        check_transition(execution_id, record.status, status)?;
        record.status = status;
        record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> PipelineResult<Option<ExecutionRecord>> {
        Ok(self.records.read().await.get(execution_id).cloned())
    }
}

/// SQLite-backed store with an append-only log table
#[derive(Debug, Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

fn db_err(e: sqlx::Error) -> PipelineError {
    PipelineError::Persistence(format!("execution store: {}", e))
}

fn parse_time(raw: &str) -> PipelineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PipelineError::Persistence(format!("bad timestamp '{}': {}", raw, e)))
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the execution tables. Safe to call multiple times.
    pub async fn init_schema(&self) -> PipelineResult<()> {
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS execution_logs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                details TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS execution_outputs (
                execution_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                output TEXT NOT NULL,
                PRIMARY KEY (execution_id, node_id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_execution_logs_execution ON execution_logs(execution_id, seq)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await.map_err(db_err)?;
        }
        Ok(())
    }

    async fn status_of(&self, execution_id: &str) -> PipelineResult<ExecutionStatus> {
        let row = sqlx::query("SELECT status FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| unknown(execution_id))?;
        let raw: String = row.get("status");
        ExecutionStatus::parse(&raw)
            .ok_or_else(|| PipelineError::Persistence(format!("unknown status '{}'", raw)))
    }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn create(&self, pipeline_id: &str) -> PipelineResult<ExecutionRecord> {
        let record = ExecutionRecord::start(new_execution_id(), pipeline_id);

        sqlx::query("INSERT INTO executions (id, pipeline_id, status, started_at) VALUES (?, ?, ?, ?)")
            .bind(&record.id)
            .bind(&record.pipeline_id)
            .bind(record.status.as_str())
            .bind(record.started_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(record)
    }

    async fn append_log(&self, execution_id: &str, entry: LogEntry) -> PipelineResult<()> {
        let details = entry.details.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO execution_logs (execution_id, timestamp, level, message, details)
            SELECT id, ?, ?, ?, ? FROM executions WHERE id = ?
            "#,
        )
        .bind(entry.timestamp.to_rfc3339())
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(details)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(unknown(execution_id));
        }
        Ok(())
    }

    async fn record_output(&self, execution_id: &str, node_id: &str, output: Value) -> PipelineResult<()> {
        self.status_of(execution_id).await?;

        sqlx::query(
            r#"
            INSERT INTO execution_outputs (execution_id, node_id, output) VALUES (?, ?, ?)
            ON CONFLICT(execution_id, node_id) DO UPDATE SET output = excluded.output
            "#,
        )
        .bind(execution_id)
        .bind(node_id)
        .bind(serde_json::to_string(&output)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn finish(&self, execution_id: &str, status: ExecutionStatus) -> PipelineResult<()> {
        let current = self.status_of(execution_id).await?;
        check_transition(execution_id, current, status)?;

        sqlx::query("UPDATE executions SET status = ?, completed_at = ? WHERE id = ? AND status = 'RUNNING'")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(execution_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(())
    }

    async fn get(&self, execution_id: &str) -> PipelineResult<Option<ExecutionRecord>> {
        let Some(row) = sqlx::query("SELECT id, pipeline_id, status, started_at, completed_at FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
        else {
            return Ok(None);
        };

        let status_raw: String = row.get("status");
        let started_at: String = row.get("started_at");
        let completed_at: Option<String> = row.get("completed_at");

        let mut record = ExecutionRecord {
            id: row.get("id"),
            pipeline_id: row.get("pipeline_id"),
            status: ExecutionStatus::parse(&status_raw)
                .ok_or_else(|| PipelineError::Persistence(format!("unknown status '{}'", status_raw)))?,
            logs: Vec::new(),
            started_at: parse_time(&started_at)?,
            completed_at: completed_at.as_deref().map(parse_time).transpose()?,
            outputs: Default::default(),
        };

        let logs = sqlx::query(
            "SELECT timestamp, level, message, details FROM execution_logs WHERE execution_id = ? ORDER BY seq",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        for log in logs {
            let timestamp: String = log.get("timestamp");
            let level: String = log.get("level");
            let details: Option<String> = log.get("details");
            record.logs.push(LogEntry {
                timestamp: parse_time(&timestamp)?,
                message: log.get("message"),
                level: LogLevel::parse(&level).unwrap_or(LogLevel::Info),
                details: details.as_deref().map(serde_json::from_str::<Value>).transpose()?,
            });
        }

        let outputs = sqlx::query("SELECT node_id, output FROM execution_outputs WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        for output in outputs {
            let raw: String = output.get("output");
            record.outputs.insert(output.get("node_id"), serde_json::from_str(&raw)?);
        }

        Ok(Some(record))
    }
}
