/// Pipeway: DAG pipeline execution engine
///
/// Pipelines are graphs of typed nodes (source, external call, transform,
/// AI processor and destinations) executed in dependency order over streamed
/// JSON items, with every run recorded and scheduled connections feeding a
/// bounded job queue.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Pipeline definitions and their SQLite store
pub mod pipeline;

// Execution records, log entries and their stores
pub mod execution;

// Per-run artifact storage
pub mod storage;

// Lazy item and byte streams over JSON files
pub mod stream;

// Node handlers and the handler registry
pub mod nodes;

// Orchestrator, job queue, schedules and the background ticker
pub mod runtime;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{PipelineError, PipelineResult};
pub use execution::{ExecutionRecord, ExecutionStatus, ExecutionStore};
pub use nodes::{HandlerRegistry, NodeHandler};
pub use pipeline::{PipelineDefinition, PipelineGraph};
pub use runtime::{JobQueue, PipelineOrchestrator, RunOptions};
pub use server::start_server;
