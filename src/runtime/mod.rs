/// Runtime
///
/// Everything that makes pipelines actually run:
/// - the petgraph-based orchestrator driving one run
/// - debug sampling of node inputs and outputs
/// - the bounded job queue all heavy work goes through
/// - schedule evaluation and the background ticker feeding the queue

// Orchestrator for a single pipeline run
pub mod engine;

// Bounded per-node samples for debug runs
pub mod debug;

// FIFO job queue with a concurrency cap
pub mod queue;

// Interval / cron due evaluation
pub mod schedule;

// Connections the ticker syncs
pub mod catalog;

// tokio-cron-scheduler tick driving due connections
pub mod scheduler;

pub use catalog::{ConnectionCatalog, FileDropCatalog, ScheduledConnection, SyncOutcome};
pub use debug::{DebugSample, DebugSamples};
pub use engine::{PipelineOrchestrator, RunFailure, RunOptions, RunOutcome};
pub use queue::{JobQueue, QueueStats};
pub use schedule::{is_due, Schedule};
pub use scheduler::ScheduleTicker;
