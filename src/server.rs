/// Server setup and initialization
///
/// Wires together all components: SQLite stores, artifact storage, the
/// handler registry, orchestrator, job queue and schedule ticker. The only
/// HTTP surface is a small health server reporting liveness and queue stats.

use crate::{
    config::Config,
    execution::SqliteExecutionStore,
    nodes::HandlerRegistry,
    pipeline::PipelineStore,
    runtime::{ConnectionCatalog, FileDropCatalog, JobQueue, PipelineOrchestrator, ScheduleTicker},
    storage::LocalStorage,
};
use anyhow::Result;
use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Long-lived engine components
#[derive(Debug, Clone)]
pub struct Engine {
    pub pipelines: PipelineStore,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub queue: JobQueue,
}

/// Open the stores and build the orchestrator and queue
///
/// Must run inside a tokio runtime; the queue spawns its dispatcher here.
pub async fn build_engine(config: &Config) -> Result<Engine> {
    tracing::info!("📁 Ensuring data directory exists: {}", config.storage.data_dir);
    std::fs::create_dir_all(config.storage.runs_dir())
        .map_err(|e| anyhow::anyhow!("Failed to create data directory: {}", e))?;

    let db_path = config.storage.database_path();
    tracing::info!("🗄️ Opening SQLite database {}", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(SqliteConnectOptions::new().filename(&db_path).create_if_missing(true))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", db_path.display(), e))?;

    let pipelines = PipelineStore::new(pool.clone());
    pipelines.init_schema().await?;
    let executions = SqliteExecutionStore::new(pool);
    executions.init_schema().await?;

    tracing::info!("⚙️ Registering node handlers");
    let client = config.http.build_client()?;
    let registry = Arc::new(HandlerRegistry::with_defaults(client));
    tracing::debug!("🧩 Node types: {:?}", registry.tags());

    let storage = Arc::new(LocalStorage::new(config.storage.runs_dir()));
    let orchestrator = Arc::new(PipelineOrchestrator::new(registry, Arc::new(executions), storage));
    let queue = JobQueue::new(config.runtime.max_concurrent_jobs);

    Ok(Engine {
        pipelines,
        orchestrator,
        queue,
    })
}

/// Health routes: `/healthz` for liveness, `/status` for queue counters
pub fn health_routes(queue: JobQueue) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/status", get(status))
        .with_state(queue)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn status(State(queue): State<JobQueue>) -> Json<Value> {
    Json(json!({ "queue": queue.stats() }))
}

/// Install the global tracing subscriber; `RUST_LOG` overrides the default filter
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .try_init();
}

/// Start the engine, the schedule ticker and the health server
///
/// Runs until ctrl-c, then stops the ticker.
pub async fn start_server(config: Config) -> Result<()> {
    init_tracing();
    tracing::info!("Starting Pipeway...");

    let engine = build_engine(&config).await?;

    let catalog_path = std::path::Path::new(&config.storage.data_dir).join("connections.json");
    let staging_dir = std::path::Path::new(&config.storage.data_dir).join("staging");
    let catalog: Arc<dyn ConnectionCatalog> = Arc::new(FileDropCatalog::load(&catalog_path, staging_dir).await?);

    let ticker = ScheduleTicker::new(
        config.runtime.tick_schedule.clone(),
        catalog,
        engine.pipelines.clone(),
        Arc::clone(&engine.orchestrator),
        engine.queue.clone(),
        config.runtime.debug,
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to initialize schedule ticker: {}", e))?;
    ticker.start().await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Health server listening on http://{}", bind_addr);

    axum::serve(listener, health_routes(engine.queue.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("🛑 Shutdown requested");
        })
        .await?;

    ticker.stop().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpConfig, RuntimeConfig, ServerConfig, StorageConfig};
    use crate::execution::ExecutionStore;
    use crate::pipeline::{PipelineDefinition, PipelineEdge, PipelineGraph, PipelineNode};
    use crate::runtime::RunOptions;

    fn config(dir: &std::path::Path) -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            storage: StorageConfig {
                data_dir: dir.display().to_string(),
            },
            runtime: RuntimeConfig {
                max_concurrent_jobs: 2,
                tick_schedule: "0 * * * * *".to_string(),
                debug: false,
            },
            http: HttpConfig {
                timeout_secs: 5,
                connect_timeout_secs: 1,
            },
        }
    }

    #[tokio::test]
    async fn engine_runs_against_sqlite_stores() {
        let dir = tempfile::tempdir().unwrap();
        let engine = build_engine(&config(dir.path())).await.unwrap();
        assert!(dir.path().join("pipeway.db").exists());

        let definition = PipelineDefinition {
            id: "p".to_string(),
            name: "copy".to_string(),
            graph: PipelineGraph {
                nodes: vec![
                    PipelineNode::new("src", "source", serde_json::json!({})),
                    PipelineNode::new("out", "file-destination", serde_json::json!({"filename": "out.json"})),
                ],
                edges: vec![PipelineEdge::new("src", "out")],
            },
        };
        engine.pipelines.save(&definition).await.unwrap();
        let loaded = engine.pipelines.get("p").await.unwrap().unwrap();

        let trigger = dir.path().join("trigger.json");
        std::fs::write(&trigger, "{\"items\":[{\"a\":1}]}").unwrap();
        let outcome = engine
            .orchestrator
            .run(&loaded.id, &loaded.graph, trigger, RunOptions::default())
            .await
            .unwrap();

        let record = engine.orchestrator.store().get(&outcome.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status.as_str(), "COMPLETED");
        assert!(record.outputs.contains_key("out"));
    }

    #[tokio::test]
    async fn status_reports_queue_stats() {
        let queue = JobQueue::new(3);
        let Json(body) = status(State(queue)).await;
        assert_eq!(body["queue"]["max_concurrency"], 3);
        assert_eq!(health_check().await, "ok");
    }
}
