/// Execution persistence
///
/// The append-only log and terminal status of each pipeline run.

pub mod record;

pub mod store;

pub use record::{ExecutionRecord, ExecutionStatus, LogEntry, LogLevel};
pub use store::{ExecutionStore, MemoryExecutionStore, SqliteExecutionStore};
