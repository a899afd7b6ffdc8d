/// Source node: the trigger file as an item sequence
///
/// The orchestrator seeds the source with the file produced by the sync
/// step. Arrays stream element by element; a single document becomes the
/// array under `itemsKey` (default `items`) or a one-item sequence.

use super::{NodeExecutionContext, NodeHandler, NodeOutput, NodeResult};
use crate::error::PipelineError;
use crate::stream::{open_items, ReadOptions};
use async_trait::async_trait;

const DEFAULT_ITEMS_KEY: &str = "items";

#[derive(Debug, Clone, Copy, Default)]
pub struct SourceHandler;

#[async_trait]
impl NodeHandler for SourceHandler {
    async fn execute(&self, ctx: NodeExecutionContext) -> NodeResult {
        let trigger = ctx.file_inputs().into_iter().next().ok_or_else(|| {
            PipelineError::NotFound(format!("source node '{}' was not given a trigger file", ctx.node_id))
        })?;

        let items_key = ctx.str_field("itemsKey").unwrap_or(DEFAULT_ITEMS_KEY);
        tracing::debug!("📂 Source {} reading {}", ctx.node_id, trigger.display());

        let items = open_items(&trigger, ReadOptions::with_items_key(items_key)).await?;
        Ok(NodeOutput::Items(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{context, drain, input_file};
    use crate::nodes::NodeInput;
    use serde_json::json;

    #[tokio::test]
    async fn streams_array_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = input_file(dir.path(), "trigger.json", &json!([{"id": 1}, {"id": 2}]));
        let out = SourceHandler.execute(context(dir.path(), json!({}), vec![trigger])).await.unwrap();
        let items: Vec<_> = drain(out).await.into_iter().map(Result::unwrap).collect();
        assert_eq!(items, vec![json!({"id": 1}), json!({"id": 2})]);
    }

    #[tokio::test]
    async fn unwraps_configured_items_key() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = input_file(dir.path(), "trigger.json", &json!({"total": 1, "records": [{"id": 9}]}));
        let out = SourceHandler
            .execute(context(dir.path(), json!({"itemsKey": "records"}), vec![trigger]))
            .await
            .unwrap();
        let items: Vec<_> = drain(out).await.into_iter().map(Result::unwrap).collect();
        assert_eq!(items, vec![json!({"id": 9})]);
    }

    #[tokio::test]
    async fn missing_trigger_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = NodeInput::File(dir.path().join("nope.json"));
        let err = SourceHandler
            .execute(context(dir.path(), json!({}), vec![missing]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotFoundError");

        let err = SourceHandler.execute(context(dir.path(), json!({}), vec![])).await.unwrap_err();
        assert_eq!(err.kind(), "NotFoundError");
    }
}
