/// Transform node
///
/// Two modes, chosen by config:
/// - `rules`: `[{ "target": "v", "source": "id" }, ...]` builds a fresh object
///   per item; sources that resolve to nothing are omitted.
/// - `expression`: a Lua expression evaluated per item with the item bound
///   to the global `item`; its value replaces the item.
///
/// The program is compiled once, then applied lazily as items are pulled.
/// The first failing item aborts the node.

use super::path::{set_dotted, FieldPath};
use super::{NodeExecutionContext, NodeHandler, NodeOutput, NodeResult};
use crate::error::{PipelineError, PipelineResult};
use crate::stream::ReadOptions;
use async_trait::async_trait;
use futures::StreamExt;
use mlua::LuaSerdeExt;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default)]
pub struct TransformHandler;

#[derive(Debug, Clone)]
struct FieldRule {
    target: String,
    source: FieldPath,
}

enum TransformProgram {
    Rules(Vec<FieldRule>),
    Lua(LuaExpression),
}

impl TransformProgram {
    fn compile(config: &Value, node_id: &str) -> PipelineResult<Self> {
        if let Some(expression) = config.get("expression").and_then(|e| e.as_str()) {
            return Ok(Self::Lua(LuaExpression::compile(expression)?));
        }

        let rules = config
            .get("rules")
            .and_then(|r| r.as_array())
            .ok_or_else(|| PipelineError::config(format!("transform '{}' needs 'rules' or 'expression'", node_id)))?;

        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let target = rule.get("target").and_then(|t| t.as_str());
            let source = rule.get("source").and_then(|s| s.as_str());
            match (target, source) {
                (Some(target), Some(source)) if !target.trim().is_empty() => compiled.push(FieldRule {
                    target: target.to_string(),
                    source: FieldPath::compile(source)?,
                }),
                _ => {
                    return Err(PipelineError::config(format!(
                        "transform '{}' has a rule without target/source: {}",
                        node_id, rule
                    )))
                }
            }
        }
        Ok(Self::Rules(compiled))
    }

    fn apply(&self, item: &Value) -> PipelineResult<Value> {
        match self {
            Self::Rules(rules) => {
                let mut out = Map::new();
                for rule in rules {
                    if let Some(value) = rule.source.resolve(item)? {
                        set_dotted(&mut out, &rule.target, value);
                    }
                }
                Ok(Value::Object(out))
            }
            Self::Lua(expr) => expr.eval(item),
        }
    }
}

/// A compiled Lua expression in its own sandboxed state
struct LuaExpression {
    lua: mlua::Lua,
    function: mlua::Function,
}

impl LuaExpression {
    fn compile(source: &str) -> PipelineResult<Self> {
        let lua = mlua::Lua::new();
        {
            let globals = lua.globals();
            for name in ["os", "io", "debug", "package", "require", "dofile", "loadfile"] {
                globals
                    .set(name, mlua::Nil)
                    .map_err(|e| PipelineError::Parse(format!("failed to sandbox Lua: {}", e)))?;
            }
        }

        // Bare expressions get an implicit return; full chunks are taken as-is
        let function = match lua.load(format!("return {}", source)).into_function() {
            Ok(function) => function,
            Err(_) => lua
                .load(source)
                .into_function()
                .map_err(|e| PipelineError::Parse(format!("invalid transform expression: {}", e)))?,
        };

        Ok(Self { lua, function })
    }

    fn eval(&self, item: &Value) -> PipelineResult<Value> {
        let lua_item = self
            .lua
            .to_value(item)
            .map_err(|e| PipelineError::Parse(format!("cannot expose item to Lua: {}", e)))?;
        self.lua
            .globals()
            .set("item", lua_item)
            .map_err(|e| PipelineError::Parse(e.to_string()))?;

        let result: mlua::Value = self
            .function
            .call(())
            .map_err(|e| PipelineError::Parse(format!("transform expression failed: {}", e)))?;
        // to_value tags arrays with a metatable, so empty arrays and nulls survive the trip
        self.lua
            .from_value::<Value>(result)
            .map_err(|e| PipelineError::Parse(format!("transform result is not JSON: {}", e)))
    }
}

#[async_trait]
impl NodeHandler for TransformHandler {
    async fn execute(&self, ctx: NodeExecutionContext) -> NodeResult {
        let program = TransformProgram::compile(&ctx.config, &ctx.node_id)?;
        let items = ctx.items(ReadOptions::default()).await?;

        let node_id = ctx.node_id.clone();
        let mut index = 0usize;
        let transformed = items.map(move |item| {
            index += 1;
            item.and_then(|value| {
                program.apply(&value).map_err(|e| match e {
                    PipelineError::Parse(msg) => {
                        PipelineError::Parse(format!("transform '{}' item {}: {}", node_id, index, msg))
                    }
                    other => other,
                })
            })
        });
        Ok(NodeOutput::Items(Box::pin(transformed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{context, drain, input_file};
    use serde_json::json;

    async fn run(config: Value, input: Value) -> Vec<PipelineResult<Value>> {
        let dir = tempfile::tempdir().unwrap();
        let file = input_file(dir.path(), "in.json", &input);
        let out = TransformHandler.execute(context(dir.path(), config, vec![file])).await.unwrap();
        drain(out).await
    }

    #[tokio::test]
    async fn rules_map_fields() {
        let items = run(
            json!({"rules": [{"target": "v", "source": "id"}]}),
            json!([{"id": 1}, {"id": 2}]),
        )
        .await;
        let items: Vec<_> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(items, vec![json!({"v": 1}), json!({"v": 2})]);
    }

    #[tokio::test]
    async fn rules_read_nested_and_omit_missing() {
        let items = run(
            json!({"rules": [
                {"target": "x", "source": "a.b"},
                {"target": "meta.missing", "source": "nope"}
            ]}),
            json!([{"a": {"b": 5}}]),
        )
        .await;
        assert_eq!(items.into_iter().map(Result::unwrap).collect::<Vec<_>>(), vec![json!({"x": 5})]);
    }

    #[tokio::test]
    async fn lua_expression_replaces_item() {
        let items = run(
            json!({"expression": "{ total = item.price * item.qty, sku = item.sku }"}),
            json!([{"price": 2.5, "qty": 4, "sku": "a1"}]),
        )
        .await;
        assert_eq!(
            items.into_iter().map(Result::unwrap).collect::<Vec<_>>(),
            vec![json!({"total": 10.0, "sku": "a1"})]
        );
    }

    #[tokio::test]
    async fn lua_chunk_with_explicit_return() {
        let items = run(
            json!({"expression": "local n = item.n\nif n > 1 then return 'big' end\nreturn 'small'"}),
            json!([{"n": 1}, {"n": 3}]),
        )
        .await;
        assert_eq!(
            items.into_iter().map(Result::unwrap).collect::<Vec<_>>(),
            vec![json!("small"), json!("big")]
        );
    }

    #[tokio::test]
    async fn failing_item_surfaces_parse_error() {
        let items = run(json!({"expression": "item.a.b"}), json!([{"a": {"b": 1}}, {"x": 1}])).await;
        assert_eq!(items[0].as_ref().unwrap(), &json!(1));
        let err = items[1].as_ref().unwrap_err();
        assert_eq!(err.kind(), "ParseError");
        assert!(err.to_string().contains("item 2"));
    }

    #[tokio::test]
    async fn lua_identity_keeps_empty_arrays_and_nulls() {
        let items = run(
            json!({"expression": "item"}),
            json!([{"id": 1, "tags": [], "scores": [1, null, 3], "meta": {}}]),
        )
        .await;
        assert_eq!(
            items[0].as_ref().unwrap(),
            &json!({"id": 1, "tags": [], "scores": [1, null, 3], "meta": {}})
        );
    }

    #[tokio::test]
    async fn sandbox_removes_os() {
        let items = run(json!({"expression": "os == nil"}), json!([{}])).await;
        assert_eq!(items[0].as_ref().unwrap(), &json!(true));
    }

    #[test]
    fn bad_config_is_rejected_at_compile_time() {
        assert!(TransformProgram::compile(&json!({}), "t").is_err());
        assert!(TransformProgram::compile(&json!({"rules": [{"target": "x"}]}), "t").is_err());
        let err = TransformProgram::compile(&json!({"expression": "(("}), "t").err().unwrap();
        assert_eq!(err.kind(), "ParseError");
    }
}
