/// Background schedule ticker
///
/// One tokio-cron-scheduler job fires on the tick schedule (every minute by
/// default). Each tick asks the `ConnectionCatalog` for scheduled
/// connections, evaluates which are due and submits a sync-then-run chain
/// for each to the `JobQueue`. A connection whose previous chain is still
/// in flight is skipped until it finishes.

use crate::pipeline::PipelineStore;
use crate::runtime::catalog::{ConnectionCatalog, ScheduledConnection};
use crate::runtime::engine::{PipelineOrchestrator, RunOptions};
use crate::runtime::queue::JobQueue;
use crate::runtime::schedule::is_due;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Shared state the tick job closes over
struct TickState {
    catalog: Arc<dyn ConnectionCatalog>,
    pipelines: PipelineStore,
    orchestrator: Arc<PipelineOrchestrator>,
    queue: JobQueue,
    /// Debug sampling for every scheduled run, on top of per-connection flags
    debug: bool,
    /// Connections with a sync chain queued or running
    in_flight: Mutex<HashSet<String>>,
}

/// Clears a connection's in-flight mark when its chain ends, panics included
struct InFlightGuard {
    state: Arc<TickState>,
    connection_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.state.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight.remove(&self.connection_id);
    }
}

pub struct ScheduleTicker {
    scheduler: Arc<RwLock<JobScheduler>>,
    tick_schedule: String,
    job_uuid: RwLock<Option<Uuid>>,
    state: Arc<TickState>,
}

impl ScheduleTicker {
    pub async fn new(
        tick_schedule: impl Into<String>,
        catalog: Arc<dyn ConnectionCatalog>,
        pipelines: PipelineStore,
        orchestrator: Arc<PipelineOrchestrator>,
        queue: JobQueue,
        debug: bool,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            tick_schedule: tick_schedule.into(),
            job_uuid: RwLock::new(None),
            state: Arc::new(TickState {
                catalog,
                pipelines,
                orchestrator,
                queue,
                debug,
                in_flight: Mutex::new(HashSet::new()),
            }),
        })
    }

    /// Register the tick job and start the scheduler
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting schedule ticker ({})", self.tick_schedule);

        let state = Arc::clone(&self.state);
        let job = Job::new_async(self.tick_schedule.as_str(), move |_uuid, _l| {
            let state = Arc::clone(&state);
            Box::pin(async move {
                let submitted = state.tick(Utc::now()).await;
                tracing::debug!("🔔 Tick submitted {} sync chains", submitted);
            })
        })?;

        let uuid = {
            let scheduler = self.scheduler.write().await;
            let uuid = scheduler.add(job).await?;
            scheduler.start().await?;
            uuid
        };
        *self.job_uuid.write().await = Some(uuid);

        tracing::info!("✅ Schedule ticker started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping schedule ticker");
        if let Some(uuid) = self.job_uuid.write().await.take() {
            let scheduler = self.scheduler.read().await;
            if let Err(e) = scheduler.remove(&uuid).await {
                tracing::warn!("⚠️ Failed to remove tick job: {}", e);
            }
        }
        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }
        tracing::info!("✅ Schedule ticker stopped");
        Ok(())
    }

    /// Evaluate every scheduled connection at `now`; returns how many were submitted
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        self.state.tick(now).await
    }
}

impl TickState {
    async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let connections = match self.catalog.scheduled().await {
            Ok(connections) => connections,
            Err(e) => {
                tracing::error!("❌ Could not list scheduled connections: {}", e);
                return 0;
            }
        };

        let mut submitted = 0;
        for connection in connections {
            if !is_due(&connection.schedule, connection.last_run_at, now) {
                continue;
            }
            let inserted = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(connection.id.clone());
            if !inserted {
                tracing::debug!("⏭️ Connection {} still syncing, skipping this tick", connection.id);
                continue;
            }

            tracing::info!("📅 Connection {} is due", connection.id);
            let guard = InFlightGuard {
                state: Arc::clone(self),
                connection_id: connection.id.clone(),
            };
            let label = format!("sync:{}", connection.id);
            self.queue.submit(label, async move { guard.state.sync_and_submit(connection, now).await });
            submitted += 1;
        }
        submitted
    }

    /// Sync one connection, then queue a run of every pipeline it names
    async fn sync_and_submit(&self, connection: ScheduledConnection, now: DateTime<Utc>) -> Result<()> {
        let outcome = self.catalog.sync(&connection).await?;
        self.catalog.mark_synced(&connection.id, now).await?;

        for pipeline_id in outcome.pipeline_ids {
            let Some(definition) = self.pipelines.get(&pipeline_id).await? else {
                tracing::warn!("⚠️ Connection {} names unknown pipeline {}", connection.id, pipeline_id);
                continue;
            };

            let orchestrator = Arc::clone(&self.orchestrator);
            let trigger = outcome.trigger_file.clone();
            let options = RunOptions {
                debug: connection.debug || self.debug,
            };
            self.queue.submit(format!("pipeline:{}", pipeline_id), async move {
                let outcome = orchestrator
                    .run(&definition.id, &definition.graph, trigger, options)
                    .await
                    .map_err(|failure| {
                        anyhow::anyhow!(
                            "run {} of pipeline {} failed: {}",
                            failure.execution_id.as_deref().unwrap_or("-"),
                            definition.id,
                            failure.error
                        )
                    })?;
                tracing::info!("🎉 Scheduled run {} of {} completed", outcome.execution_id, definition.id);
                Ok(())
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineResult;
    use crate::execution::{ExecutionStore, MemoryExecutionStore};
    use crate::nodes::HandlerRegistry;
    use crate::pipeline::{PipelineDefinition, PipelineEdge, PipelineGraph, PipelineNode};
    use crate::runtime::catalog::SyncOutcome;
    use crate::storage::LocalStorage;
    use async_trait::async_trait;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::path::PathBuf;

    struct StaticCatalog {
        connections: Vec<ScheduledConnection>,
        trigger: PathBuf,
        synced: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConnectionCatalog for StaticCatalog {
        async fn scheduled(&self) -> PipelineResult<Vec<ScheduledConnection>> {
            Ok(self.connections.clone())
        }

        async fn sync(&self, connection: &ScheduledConnection) -> PipelineResult<SyncOutcome> {
            self.synced.lock().unwrap().push(connection.id.clone());
            Ok(SyncOutcome {
                trigger_file: self.trigger.clone(),
                pipeline_ids: vec!["p1".to_string(), "missing".to_string()],
            })
        }

        async fn mark_synced(&self, _connection_id: &str, _at: DateTime<Utc>) -> PipelineResult<()> {
            Ok(())
        }
    }

    fn connection(id: &str, schedule: &str, last_run_at: Option<DateTime<Utc>>) -> ScheduledConnection {
        ScheduledConnection {
            id: id.to_string(),
            schedule: schedule.to_string(),
            last_run_at,
            debug: false,
        }
    }

    #[tokio::test]
    async fn due_connections_sync_and_run_pipelines() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = dir.path().join("trigger.json");
        std::fs::write(&trigger, "[{\"id\":1}]").unwrap();

        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await.unwrap();
        let pipelines = PipelineStore::new(pool);
        pipelines.init_schema().await.unwrap();
        pipelines
            .save(&PipelineDefinition {
                id: "p1".to_string(),
                name: "copy".to_string(),
                graph: PipelineGraph {
                    nodes: vec![
                        PipelineNode::new("src", "source", json!({})),
                        PipelineNode::new("out", "file-destination", json!({"filename": "copy.json"})),
                    ],
                    edges: vec![PipelineEdge::new("src", "out")],
                },
            })
            .await
            .unwrap();

        let store = Arc::new(MemoryExecutionStore::new());
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            Arc::new(HandlerRegistry::with_defaults(reqwest::Client::new())),
            store.clone(),
            Arc::new(LocalStorage::new(dir.path().join("runs"))),
        ));
        let catalog = Arc::new(StaticCatalog {
            connections: vec![
                connection("due", "15", None),
                connection("recent", "15", Some(Utc::now())),
                connection("broken", "not a schedule", None),
            ],
            trigger,
            synced: Mutex::new(Vec::new()),
        });
        let queue = JobQueue::new(2);
        let ticker = ScheduleTicker::new("0 * * * * *", catalog.clone(), pipelines, orchestrator, queue.clone(), false)
            .await
            .unwrap();

        assert_eq!(ticker.tick(Utc::now()).await, 1);
        queue.wait_idle().await;

        assert_eq!(*catalog.synced.lock().unwrap(), vec!["due".to_string()]);
        let runs = store.all().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].pipeline_id, "p1");
        let record = store.get(&runs[0].id).await.unwrap().unwrap();
        assert!(record.status.is_terminal());
        assert_eq!(queue.stats().failed, 0);
    }

    /// Sync blows up every time it is asked
    struct PanickingCatalog;

    #[async_trait]
    impl ConnectionCatalog for PanickingCatalog {
        async fn scheduled(&self) -> PipelineResult<Vec<ScheduledConnection>> {
            Ok(vec![connection("flaky", "15", None)])
        }

        async fn sync(&self, _connection: &ScheduledConnection) -> PipelineResult<SyncOutcome> {
            panic!("sync exploded");
        }

        async fn mark_synced(&self, _connection_id: &str, _at: DateTime<Utc>) -> PipelineResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn panicking_sync_does_not_wedge_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await.unwrap();
        let pipelines = PipelineStore::new(pool);
        pipelines.init_schema().await.unwrap();
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            Arc::new(HandlerRegistry::new()),
            Arc::new(MemoryExecutionStore::new()),
            Arc::new(LocalStorage::new(dir.path().join("runs"))),
        ));
        let queue = JobQueue::new(1);
        let ticker = ScheduleTicker::new(
            "0 * * * * *",
            Arc::new(PanickingCatalog),
            pipelines,
            orchestrator,
            queue.clone(),
            false,
        )
        .await
        .unwrap();

        assert_eq!(ticker.tick(Utc::now()).await, 1);
        queue.wait_idle().await;
        assert_eq!(queue.stats().failed, 1);

        assert_eq!(ticker.tick(Utc::now()).await, 1);
        queue.wait_idle().await;
        assert_eq!(queue.stats().failed, 2);
    }
}
