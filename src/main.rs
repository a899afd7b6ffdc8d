/// Pipeway: DAG pipeline execution engine
///
/// Main entry point. Loads configuration from the environment and starts the
/// engine: the schedule ticker, the job queue and the health server
/// (`/healthz`, `/status`).

use pipeway::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults plus PIPEWAY_* environment overrides
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
