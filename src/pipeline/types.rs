/// Core pipeline type definitions
///
/// Defines the graph structures a pipeline run walks: nodes carrying a type
/// tag and an opaque config object, and directed edges between them. These
/// types are serialized/deserialized from JSON for persistence.

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Type tag of the node every run is seeded from
pub const SOURCE_NODE_TYPE: &str = "source";

/// A stored pipeline: identity plus the graph to execute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Unique pipeline identifier (e.g., "pl-orders")
    pub id: String,
    /// Human-readable pipeline name
    pub name: String,
    pub graph: PipelineGraph,
}

/// Nodes and edges of one pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineGraph {
    pub nodes: Vec<PipelineNode>,
    #[serde(default)]
    pub edges: Vec<PipelineEdge>,
}

/// A single node in the pipeline DAG
///
/// The `type` tag selects the handler from the registry; `config` is handed
/// to that handler untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineNode {
    /// Unique node identifier within the pipeline (e.g., "n1", "src")
    pub id: String,
    /// Handler type tag (e.g., "source", "transform", "file-destination")
    #[serde(rename = "type")]
    pub node_type: String,
    /// Node-specific configuration as flexible JSON
    #[serde(default)]
    pub config: Value,
}

/// Connection between two nodes: `source`'s output feeds `target`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineEdge {
    pub source: String,
    pub target: String,
}

impl PipelineNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config,
        }
    }
}

impl PipelineEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl PipelineGraph {
    /// Locate the unique source node
    ///
    /// Fails on an empty graph, a graph without a source node and a graph
    /// with more than one.
    pub fn source_node(&self) -> PipelineResult<&PipelineNode> {
        if self.nodes.is_empty() {
            return Err(PipelineError::config("pipeline graph has no nodes"));
        }

        let mut sources = self.nodes.iter().filter(|n| n.node_type == SOURCE_NODE_TYPE);
        let first = sources
            .next()
            .ok_or_else(|| PipelineError::config("pipeline graph has no source node"))?;

        if let Some(second) = sources.next() {
            return Err(PipelineError::Configuration(format!(
                "pipeline graph has more than one source node ('{}', '{}')",
                first.id, second.id
            )));
        }

        Ok(first)
    }

    /// Check node ids are unique and every edge references an existing node
    pub fn validate_references(&self) -> PipelineResult<()> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(PipelineError::Configuration(format!("duplicate node id '{}'", node.id)));
            }
        }

        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if !ids.contains(end.as_str()) {
                    return Err(PipelineError::Configuration(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, end
                    )));
                }
            }
        }

        Ok(())
    }
}
