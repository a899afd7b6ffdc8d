/// Petgraph-based pipeline orchestrator
///
/// Drives one run of a pipeline graph: creates the execution record, checks
/// the graph is a single-source DAG, seeds the source node with the trigger
/// file and walks the nodes reachable from it breadth-first, running a node
/// once every reachable parent has finished. Lazy node outputs are persisted
/// to the run directory before children see them, so downstream nodes only
/// ever receive file references or inline summaries.
///
/// Nodes run one at a time within a run; concurrency comes from running
/// several runs through the `JobQueue`.

use crate::error::{PipelineError, PipelineResult};
use crate::execution::{ExecutionRecord, ExecutionStatus, ExecutionStore, LogEntry};
use crate::nodes::{HandlerRegistry, NodeExecutionContext, NodeInput, NodeOutput, RunScope};
use crate::pipeline::{PipelineGraph, PipelineNode};
use crate::runtime::debug::{sample_files, sample_inputs, shrink, DebugSample, DebugSamples};
use crate::storage::{file_safe, ArtifactStorage, INTERMEDIATE_PREFIX};
use crate::stream::{json_array_bytes, ByteStream};
use bytes::Bytes;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Collect bounded input/output samples per node
    pub debug: bool,
}

/// A finished, successful run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    /// Present only when the run had debug mode on
    pub debug_samples: Option<DebugSamples>,
}

/// A failed run; `execution_id` is set whenever the record was created
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RunFailure {
    pub execution_id: Option<String>,
    #[source]
    pub error: PipelineError,
}

/// A persisted node result as children see it
#[derive(Debug, Clone)]
enum StoredOutput {
    File(PathBuf),
    Summary(Map<String, Value>),
}

impl StoredOutput {
    fn as_input(&self) -> NodeInput {
        match self {
            Self::File(path) => NodeInput::File(path.clone()),
            Self::Summary(map) => NodeInput::Summary(map.clone()),
        }
    }

    fn record_value(&self) -> Value {
        match self {
            Self::File(path) => json!({"filePath": path.display().to_string()}),
            Self::Summary(map) => Value::Object(map.clone()),
        }
    }
}

/// Validated graph with the traversal facts the run needs
struct ExecutionPlan<'g> {
    graph: DiGraph<&'g PipelineNode, ()>,
    index_of: HashMap<&'g str, NodeIndex>,
    source: NodeIndex,
    /// target -> sources, in edge declaration order
    parents: HashMap<&'g str, Vec<&'g str>>,
    /// source -> targets, in edge declaration order
    children: HashMap<&'g str, Vec<&'g str>>,
}

impl<'g> ExecutionPlan<'g> {
    fn build(pipeline: &'g PipelineGraph) -> PipelineResult<Self> {
        pipeline.validate_references()?;
        let source_node = pipeline.source_node()?;

        let mut graph = DiGraph::new();
        let mut index_of = HashMap::new();
        for node in &pipeline.nodes {
            index_of.insert(node.id.as_str(), graph.add_node(node));
        }

        let mut parents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &pipeline.edges {
            let (Some(&from), Some(&to)) = (index_of.get(edge.source.as_str()), index_of.get(edge.target.as_str()))
            else {
                return Err(PipelineError::config(format!(
                    "edge {} -> {} references an unknown node",
                    edge.source, edge.target
                )));
            };
            graph.add_edge(from, to, ());
            parents.entry(edge.target.as_str()).or_default().push(edge.source.as_str());
            children.entry(edge.source.as_str()).or_default().push(edge.target.as_str());
        }

        if is_cyclic_directed(&graph) {
            return Err(PipelineError::config("pipeline graph contains a cycle"));
        }

        let source = index_of[source_node.id.as_str()];
        Ok(Self {
            graph,
            index_of,
            source,
            parents,
            children,
        })
    }

    /// Every node reachable from the source, the source included
    fn reachable(&self) -> HashSet<NodeIndex> {
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::new();
        reachable.insert(self.source);
        queue.push_back(self.source);

        while let Some(current) = queue.pop_front() {
            for target in self.graph.neighbors(current) {
                if reachable.insert(target) {
                    queue.push_back(target);
                }
            }
        }
        reachable
    }

    fn node(&self, id: &str) -> (NodeIndex, &'g PipelineNode) {
        let idx = self.index_of[id];
        (idx, self.graph[idx])
    }

    fn is_reachable(&self, reachable: &HashSet<NodeIndex>, id: &str) -> bool {
        self.index_of.get(id).map(|idx| reachable.contains(idx)).unwrap_or(false)
    }
}

/// File-safe artifact name for a node's intermediate result
///
/// The graph index keeps names distinct when two ids sanitize alike.
fn artifact_name(index: NodeIndex, node_id: &str) -> String {
    format!("{}{}-{}.json", INTERMEDIATE_PREFIX, index.index(), file_safe(node_id))
}

pub struct PipelineOrchestrator {
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn ExecutionStore>,
    storage: Arc<dyn ArtifactStorage>,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("registry", &self.registry)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    pub fn new(registry: Arc<HandlerRegistry>, store: Arc<dyn ExecutionStore>, storage: Arc<dyn ArtifactStorage>) -> Self {
        Self {
            registry,
            store,
            storage,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn storage(&self) -> &Arc<dyn ArtifactStorage> {
        &self.storage
    }

    /// Run `graph` once, seeded with `trigger_file`
    ///
    /// The execution record is created before any node runs and ends
    /// COMPLETED or FAILED; a failure is also returned to the caller.
    pub async fn run(
        &self,
        pipeline_id: &str,
        graph: &PipelineGraph,
        trigger_file: PathBuf,
        options: RunOptions,
    ) -> Result<RunOutcome, RunFailure> {
        let started = std::time::Instant::now();
        let record = self.store.create(pipeline_id).await.map_err(|error| RunFailure {
            execution_id: None,
            error,
        })?;
        tracing::info!("🚀 Run {} of pipeline {} started", record.id, pipeline_id);

        match self.drive(&record, graph, trigger_file, options).await {
            Ok(debug_samples) => {
                self.store
                    .finish(&record.id, ExecutionStatus::Completed)
                    .await
                    .map_err(|error| RunFailure {
                        execution_id: Some(record.id.clone()),
                        error,
                    })?;
                tracing::info!("🎉 Run {} completed in {:?}", record.id, started.elapsed());
                Ok(RunOutcome {
                    execution_id: record.id,
                    status: ExecutionStatus::Completed,
                    debug_samples,
                })
            }
            Err(error) => {
                if let Err(e) = self.store.finish(&record.id, ExecutionStatus::Failed).await {
                    tracing::error!("❌ Could not mark run {} failed: {}", record.id, e);
                }
                tracing::error!("❌ Run {} failed after {:?}: {}", record.id, started.elapsed(), error);
                Err(RunFailure {
                    execution_id: Some(record.id),
                    error,
                })
            }
        }
    }

    async fn log(&self, execution_id: &str, entry: LogEntry) -> PipelineResult<()> {
        self.store.append_log(execution_id, entry).await
    }

    /// Record the error entry of a failed run, then hand the error back
    async fn log_failure(&self, execution_id: &str, error: PipelineError, node: Option<&PipelineNode>) -> PipelineError {
        let (message, details) = match node {
            Some(node) => (
                format!("Node '{}' ({}) failed: {}", node.id, node.node_type, error),
                json!({"nodeId": node.id, "nodeType": node.node_type, "errorKind": error.kind()}),
            ),
            None => (
                format!("Pipeline run failed: {}", error),
                json!({"errorKind": error.kind()}),
            ),
        };
        if let Err(e) = self.log(execution_id, LogEntry::error(message).with_details(details)).await {
            tracing::error!("❌ Could not log failure of run {}: {}", execution_id, e);
        }
        error
    }

    async fn drive(
        &self,
        record: &ExecutionRecord,
        pipeline: &PipelineGraph,
        trigger_file: PathBuf,
        options: RunOptions,
    ) -> PipelineResult<Option<DebugSamples>> {
        let execution_id = record.id.as_str();
        self.log(
            execution_id,
            LogEntry::info("Pipeline run started").with_details(json!({
                "trigger": trigger_file.display().to_string(),
                "debug": options.debug,
            })),
        )
        .await?;

        let plan = match ExecutionPlan::build(pipeline) {
            Ok(plan) => plan,
            Err(e) => return Err(self.log_failure(execution_id, e, None).await),
        };

        let reachable = plan.reachable();
        for node in &pipeline.nodes {
            if !plan.is_reachable(&reachable, &node.id) {
                tracing::warn!("⏭️ Node '{}' is not reachable from the source, skipping", node.id);
                self.log(
                    execution_id,
                    LogEntry::warn(format!("Node '{}' is not reachable from the source and was skipped", node.id))
                        .with_details(json!({"nodeId": node.id})),
                )
                .await?;
            }
        }

        // reachable parents still to finish, per reachable node
        let mut pending: HashMap<&str, usize> = HashMap::new();
        for idx in &reachable {
            let id = plan.graph[*idx].id.as_str();
            let count = plan
                .parents
                .get(id)
                .map(|ps| ps.iter().filter(|p| plan.is_reachable(&reachable, p)).count())
                .unwrap_or(0);
            pending.insert(id, count);
        }

        let scope = Arc::new(RunScope {
            execution_id: execution_id.to_string(),
            pipeline_id: record.pipeline_id.clone(),
            storage: self.storage.clone(),
        });

        let mut outputs: HashMap<&str, StoredOutput> = HashMap::new();
        let mut samples = DebugSamples::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let source_id = plan.graph[plan.source].id.as_str();
        queue.push_back(source_id);

        let mut step = 0usize;
        while let Some(node_id) = queue.pop_front() {
            step += 1;
            let (node_index, node) = plan.node(node_id);

            let inputs: Vec<NodeInput> = if node_id == source_id {
                vec![NodeInput::File(trigger_file.clone())]
            } else {
                plan.parents
                    .get(node_id)
                    .into_iter()
                    .flatten()
                    .filter_map(|parent| outputs.get(parent).map(StoredOutput::as_input))
                    .collect()
            };

            let mut sample = DebugSample::default();
            if options.debug {
                sample.input = sample_inputs(&inputs).await;
            }

            tracing::info!("📍 Step {}/{}: node '{}' ({})", step, reachable.len(), node.id, node.node_type);
            self.log(
                execution_id,
                LogEntry::info(format!("About to execute node '{}'", node.id)).with_details(json!({
                    "nodeId": node.id,
                    "nodeType": node.node_type,
                    "inputs": inputs.len(),
                })),
            )
            .await?;

            let node_started = std::time::Instant::now();
            let ctx = NodeExecutionContext {
                node_id: node.id.clone(),
                config: node.config.clone(),
                inputs,
                run: scope.clone(),
            };
            let stored = match self.execute_and_persist(node_index, node, ctx).await {
                Ok(stored) => stored,
                Err(e) => return Err(self.log_failure(execution_id, e, Some(node)).await),
            };

            self.store.record_output(execution_id, &node.id, stored.record_value()).await?;
            tracing::info!("✅ Node '{}' completed in {:?}", node.id, node_started.elapsed());
            self.log(
                execution_id,
                LogEntry::info(format!("Node '{}' completed", node.id)).with_details(json!({
                    "nodeId": node.id,
                    "output": stored.record_value(),
                    "durationMs": node_started.elapsed().as_millis() as u64,
                })),
            )
            .await?;

            if options.debug {
                sample.output = match &stored {
                    StoredOutput::File(path) => sample_files(vec![path.clone()]).await,
                    StoredOutput::Summary(map) => vec![shrink(&Value::Object(map.clone()))],
                };
                samples.insert(node.id.clone(), sample);
            }
            outputs.insert(node_id, stored);

            for child in plan.children.get(node_id).into_iter().flatten() {
                if let Some(remaining) = pending.get_mut(child) {
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }

        if !options.debug {
            return Ok(None);
        }
        self.log(
            execution_id,
            LogEntry::info("Debug samples").with_details(serde_json::to_value(&samples)?),
        )
        .await?;
        Ok(Some(samples))
    }

    /// Run a handler and persist whatever lazy output it returns
    async fn execute_and_persist(
        &self,
        index: NodeIndex,
        node: &PipelineNode,
        ctx: NodeExecutionContext,
    ) -> PipelineResult<StoredOutput> {
        let handler = self.registry.get(&node.node_type)?;
        let execution_id = ctx.run.execution_id.clone();
        let name = artifact_name(index, &node.id);

        let bytes: ByteStream = match handler.execute(ctx).await? {
            NodeOutput::File(path) => return Ok(StoredOutput::File(path)),
            NodeOutput::Summary(map) => return Ok(StoredOutput::Summary(map)),
            NodeOutput::Items(items) => json_array_bytes(items),
            NodeOutput::Bytes(bytes) => bytes,
            NodeOutput::Inline(value) => {
                let encoded = Bytes::from(serde_json::to_vec(&value)?);
                Box::pin(futures::stream::iter([Ok(encoded)]))
            }
        };

        let stored = self.storage.save(&execution_id, &name, bytes).await?;
        tracing::debug!("💾 Node '{}' output persisted to {}", node.id, stored.path.display());
        Ok(StoredOutput::File(stored.path))
    }

    /// Delete the intermediate node files of a finished run, keeping destination files
    pub async fn purge_intermediates(&self, execution_id: &str) -> PipelineResult<usize> {
        let mut removed = 0;
        for path in self.storage.list(execution_id).await? {
            let intermediate = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(INTERMEDIATE_PREFIX))
                .unwrap_or(false);
            if intermediate {
                self.storage.delete(&path).await?;
                removed += 1;
            }
        }
        tracing::debug!("🧹 Purged {} intermediate files of run {}", removed, execution_id);
        Ok(removed)
    }
}
