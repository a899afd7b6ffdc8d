/// File destination node
///
/// Writes upstream data into the run's output directory. A single upstream
/// file is copied byte for byte; several upstream files are merged into one
/// JSON array. `filename` may contain `{timestamp}`, `{date}` and `{node}`
/// tokens; names starting with the intermediate-file prefix are refused so a
/// destination can neither clobber nor be purged as an intermediate result.

use super::{NodeExecutionContext, NodeHandler, NodeOutput, NodeResult};
use crate::error::PipelineError;
use crate::storage::{file_bytes, file_safe, INTERMEDIATE_PREFIX};
use crate::stream::{json_array_bytes, ReadOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

const DEFAULT_FILENAME: &str = "output_{node}_{timestamp}.json";

#[derive(Debug, Clone, Copy, Default)]
pub struct FileDestinationHandler;

/// Expand `{timestamp}`, `{date}` and `{node}` in a filename template
pub fn render_filename(template: &str, node_id: &str, now: DateTime<Utc>) -> String {
    template
        .replace("{timestamp}", &now.format("%Y%m%dT%H%M%S").to_string())
        .replace("{date}", &now.format("%Y-%m-%d").to_string())
        .replace("{node}", &file_safe(node_id))
}

#[async_trait]
impl NodeHandler for FileDestinationHandler {
    async fn execute(&self, ctx: NodeExecutionContext) -> NodeResult {
        let template = ctx.str_field("filename").unwrap_or(DEFAULT_FILENAME);
        let name = render_filename(template, &ctx.node_id, Utc::now());
        if name.starts_with(INTERMEDIATE_PREFIX) {
            return Err(PipelineError::Configuration(format!(
                "file destination '{}': filename '{}' uses the reserved '{}' prefix",
                ctx.node_id, name, INTERMEDIATE_PREFIX
            )));
        }
        let execution_id = &ctx.run.execution_id;

        let files = ctx.file_inputs();
        let stored = if let [single] = files.as_slice() {
            ctx.run.storage.save(execution_id, &name, file_bytes(single.clone())).await?
        } else {
            let items = ctx.items(ReadOptions::default()).await?;
            ctx.run.storage.save(execution_id, &name, json_array_bytes(items)).await?
        };

        tracing::info!("📝 {} wrote {} ({} bytes)", ctx.node_id, stored.path.display(), stored.bytes);
        Ok(NodeOutput::File(stored.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{context, input_file};
    use chrono::TimeZone;
    use serde_json::{json, Value};

    #[test]
    fn filename_tokens_expand() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(render_filename("out_{date}.json", "n", now), "out_2024-03-09.json");
        assert_eq!(render_filename("out_{timestamp}.json", "n", now), "out_20240309T070501.json");
        assert_eq!(render_filename("fixed.json", "n", now), "fixed.json");
        assert_eq!(
            render_filename(DEFAULT_FILENAME, "save/orders", now),
            "output_save_orders_20240309T070501.json"
        );
    }

    #[tokio::test]
    async fn reserved_prefix_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = input_file(dir.path(), "in.json", &json!([1]));
        let err = FileDestinationHandler
            .execute(context(dir.path(), json!({"filename": "node-0-src.json"}), vec![input]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
        assert!(!dir.path().join("runs/exec-test/node-0-src.json").exists());
    }

    #[tokio::test]
    async fn default_names_differ_per_node() {
        let dir = tempfile::tempdir().unwrap();
        let input = input_file(dir.path(), "in.json", &json!([1]));
        let mut first = context(dir.path(), json!({}), vec![input.clone()]);
        first.node_id = "save-a".to_string();
        let mut second = context(dir.path(), json!({}), vec![input]);
        second.node_id = "save-b".to_string();

        let (NodeOutput::File(a), NodeOutput::File(b)) = (
            FileDestinationHandler.execute(first).await.unwrap(),
            FileDestinationHandler.execute(second).await.unwrap(),
        ) else {
            panic!("expected file outputs");
        };
        assert_ne!(a, b);
        assert!(a.exists() && b.exists());
    }

    #[tokio::test]
    async fn single_input_is_copied_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let input = input_file(dir.path(), "in.json", &json!([{"id": 1}, {"id": 2}, {"id": 3}]));
        let out = FileDestinationHandler
            .execute(context(dir.path(), json!({"filename": "final.json"}), vec![input]))
            .await
            .unwrap();

        let NodeOutput::File(path) = out else {
            panic!("expected a file output");
        };
        assert!(path.ends_with("exec-test/final.json"));
        let written: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, json!([{"id": 1}, {"id": 2}, {"id": 3}]));
    }

    #[tokio::test]
    async fn several_inputs_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        let a = input_file(dir.path(), "a.json", &json!([{"id": 1}]));
        let b = input_file(dir.path(), "b.json", &json!({"id": 2}));
        let out = FileDestinationHandler
            .execute(context(dir.path(), json!({"filename": "merged.json"}), vec![a, b]))
            .await
            .unwrap();

        let NodeOutput::File(path) = out else {
            panic!("expected a file output");
        };
        let written: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, json!([{"id": 1}, {"id": 2}]));
    }

    #[tokio::test]
    async fn no_inputs_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileDestinationHandler
            .execute(context(dir.path(), json!({}), vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }
}
