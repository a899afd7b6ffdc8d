/// Node handlers
///
/// Every node type is a `NodeHandler` registered under its type tag. The
/// orchestrator looks handlers up in the `HandlerRegistry`, hands them a
/// `NodeExecutionContext` (node id, config, upstream references) and gets a
/// `NodeOutput` back. Handlers never see each other; they only exchange
/// persisted files and inline summaries through the orchestrator.

use crate::error::{PipelineError, PipelineResult};
use crate::storage::ArtifactStorage;
use crate::stream::{open_items_chain, ByteStream, ItemStream, ReadOptions};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

// Trigger-file reader
pub mod source;

// HTTP request node
pub mod http;

// Rule / Lua expression transforms
pub mod transform;

// Chat-completion enrichment
pub mod ai;

// Write to the run directory
pub mod file_destination;

// Row inserts into postgres, clickhouse and sqlite
pub mod database;

// JSON path resolution shared by transform, ai and database handlers
pub mod path;

/// Reference to an upstream result, as seen by a downstream node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeInput {
    /// A persisted JSON document (array of items or a single document)
    File(PathBuf),
    /// Metadata-only result such as a row count
    Summary(Map<String, Value>),
}

/// What a handler produced
///
/// Lazy variants are persisted by the orchestrator before anything
/// downstream sees them; `File` passes through and `Summary` stays inline.
pub enum NodeOutput {
    /// Structured data held in memory
    Inline(Value),
    /// Lazy item sequence
    Items(ItemStream),
    /// Lazy raw document body, persisted verbatim
    Bytes(ByteStream),
    /// Already persisted file
    File(PathBuf),
    /// Metadata-only result, never persisted as a file
    Summary(Map<String, Value>),
}

impl fmt::Debug for NodeOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(v) => f.debug_tuple("Inline").field(v).finish(),
            Self::Items(_) => f.write_str("Items(<stream>)"),
            Self::Bytes(_) => f.write_str("Bytes(<stream>)"),
            Self::File(p) => f.debug_tuple("File").field(p).finish(),
            Self::Summary(m) => f.debug_tuple("Summary").field(m).finish(),
        }
    }
}

/// Outcome of one handler invocation
pub type NodeResult = PipelineResult<NodeOutput>;

/// Run-wide facts every handler may need
#[derive(Debug, Clone)]
pub struct RunScope {
    pub execution_id: String,
    pub pipeline_id: String,
    pub storage: Arc<dyn ArtifactStorage>,
}

/// Everything a handler gets to execute one node
#[derive(Debug, Clone)]
pub struct NodeExecutionContext {
    pub node_id: String,
    pub config: Value,
    /// Upstream references in incoming-edge order
    pub inputs: Vec<NodeInput>,
    pub run: Arc<RunScope>,
}

impl NodeExecutionContext {
    pub fn file_inputs(&self) -> Vec<PathBuf> {
        self.inputs
            .iter()
            .filter_map(|input| match input {
                NodeInput::File(path) => Some(path.clone()),
                NodeInput::Summary(_) => None,
            })
            .collect()
    }

    /// All upstream items, file after file, as one lazy sequence
    pub async fn items(&self, options: ReadOptions) -> PipelineResult<ItemStream> {
        let files = self.file_inputs();
        if files.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "node '{}' has no upstream data to read",
                self.node_id
            )));
        }
        open_items_chain(files, options).await
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn require_str(&self, key: &str) -> PipelineResult<&str> {
        self.str_field(key)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| PipelineError::Configuration(format!("node '{}' missing '{}' config", self.node_id, key)))
    }

    pub fn bool_field(&self, key: &str) -> bool {
        self.config.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }
}

/// A node type's execution logic
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, ctx: NodeExecutionContext) -> NodeResult;
}

/// Type tag -> handler table, built once and injected into the orchestrator
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry").field("tags", &self.tags()).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in node type
    ///
    /// `client` is shared by every handler that talks HTTP.
    pub fn with_defaults(client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register("source", source::SourceHandler);
        registry.register("external-call", http::ExternalCallHandler::new(client.clone()));
        registry.register("transform", transform::TransformHandler);
        registry.register("ai-processor", ai::AiProcessorHandler::new(client.clone()));
        registry.register("file-destination", file_destination::FileDestinationHandler);
        registry.register(
            "postgres-destination",
            database::DatabaseDestinationHandler::new(database::postgres::PostgresDialect),
        );
        registry.register(
            "clickhouse-destination",
            database::DatabaseDestinationHandler::new(database::clickhouse::ClickHouseDialect::new(client)),
        );
        registry.register(
            "sqlite-destination",
            database::DatabaseDestinationHandler::new(database::sqlite::SqliteDialect),
        );
        registry
    }

    pub fn register(&mut self, tag: impl Into<String>, handler: impl NodeHandler + 'static) {
        self.handlers.insert(tag.into(), Arc::new(handler));
    }

    pub fn get(&self, tag: &str) -> PipelineResult<Arc<dyn NodeHandler>> {
        self.handlers
            .get(tag)
            .cloned()
            .ok_or_else(|| PipelineError::Configuration(format!("unknown node type '{}'", tag)))
    }

    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}
