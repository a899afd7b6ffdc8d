/// Pipeline definitions
///
/// Graph types (nodes, edges, definitions) and the SQLite store they are
/// loaded from.

pub mod types;

pub mod storage;

pub use storage::PipelineStore;
pub use types::{PipelineDefinition, PipelineEdge, PipelineGraph, PipelineNode, SOURCE_NODE_TYPE};
