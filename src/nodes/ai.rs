/// AI processor node
///
/// For every item: fill `{{field}}` placeholders in the prompt template from
/// the item, send it to an OpenAI-compatible chat-completions endpoint and
/// attach the reply under `outputField`. With `parseJson` the reply is parsed
/// as JSON (code fences tolerated); a reply that does not parse is kept as text.
///
/// Config:
/// ```json
/// { "endpoint": "https://api.openai.com/v1/chat/completions",
///   "apiKey": "...", "apiKeyEnv": "OPENAI_API_KEY", "model": "gpt-4o-mini",
///   "prompt": "Classify {{title}}", "systemPrompt": "...",
///   "outputField": "ai_response", "parseJson": false, "temperature": 0.2 }
/// ```

use super::path::FieldPath;
use super::{NodeExecutionContext, NodeHandler, NodeOutput, NodeResult};
use crate::error::{PipelineError, PipelineResult};
use crate::nodes::http::error_for_status;
use crate::stream::{ItemStream, ReadOptions};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_OUTPUT_FIELD: &str = "ai_response";

#[derive(Debug, Clone)]
pub struct AiProcessorHandler {
    client: reqwest::Client,
}

impl AiProcessorHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Field(FieldPath),
}

/// A prompt template split into literal text and `{{path}}` placeholders
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn parse(template: &str) -> PipelineResult<Self> {
        let mut segments = Vec::new();
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let path = rest[start + 2..start + 2 + len].trim();
            segments.push(Segment::Field(FieldPath::compile(path)?));
            rest = &rest[start + 2 + len + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }
        Ok(Self { segments })
    }

    /// Fill placeholders from `item`; strings are inserted raw, other values as JSON, misses as ""
    pub fn render(&self, item: &Value) -> PipelineResult<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Field(path) => match path.resolve(item)? {
                    Some(Value::String(s)) => out.push_str(&s),
                    Some(Value::Null) | None => {}
                    Some(other) => out.push_str(&other.to_string()),
                },
            }
        }
        Ok(out)
    }
}

/// Everything needed to enrich one item, shared across the lazy stream
#[derive(Debug, Clone)]
struct CompletionRequest {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    system_prompt: Option<String>,
    temperature: Option<f64>,
    prompt: PromptTemplate,
    output_field: String,
    parse_json: bool,
}

impl CompletionRequest {
    fn from_context(client: reqwest::Client, ctx: &NodeExecutionContext) -> PipelineResult<Self> {
        let api_key = match ctx.str_field("apiKey") {
            Some(key) => Some(key.to_string()),
            None => ctx.str_field("apiKeyEnv").and_then(|var| std::env::var(var).ok()),
        };
        Ok(Self {
            client,
            endpoint: ctx.str_field("endpoint").unwrap_or(DEFAULT_ENDPOINT).to_string(),
            api_key,
            model: ctx.require_str("model")?.to_string(),
            system_prompt: ctx.str_field("systemPrompt").map(str::to_string),
            temperature: ctx.config.get("temperature").and_then(|t| t.as_f64()),
            prompt: PromptTemplate::parse(ctx.require_str("prompt")?)?,
            output_field: ctx.str_field("outputField").unwrap_or(DEFAULT_OUTPUT_FIELD).to_string(),
            parse_json: ctx.bool_field("parseJson"),
        })
    }

    async fn complete(&self, prompt: String) -> PipelineResult<String> {
        let mut messages = Vec::new();
        if let Some(system) = &self.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let mut body = json!({"model": self.model, "messages": messages});
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = error_for_status(request.send().await?, "AI endpoint").await?;
        let reply: Value = response.json().await?;
        reply
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| PipelineError::external("AI endpoint reply has no choices[0].message.content"))
    }

    async fn enrich(&self, item: Value) -> PipelineResult<Value> {
        let prompt = self.prompt.render(&item)?;
        let reply = self.complete(prompt).await?;

        let value = if self.parse_json {
            match serde_json::from_str::<Value>(strip_code_fence(&reply)) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!("⚠️ AI reply is not JSON ({}), keeping text", e);
                    Value::String(reply)
                }
            }
        } else {
            Value::String(reply)
        };

        Ok(match item {
            Value::Object(mut fields) => {
                fields.insert(self.output_field.clone(), value);
                Value::Object(fields)
            }
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("input".to_string(), other);
                wrapped.insert(self.output_field.clone(), value);
                Value::Object(wrapped)
            }
        })
    }
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the language tag line, e.g. ```json
    let inner = match inner.find('\n') {
        Some(newline) => &inner[newline + 1..],
        None => inner,
    };
    inner.trim_end().strip_suffix("```").unwrap_or(inner).trim()
}

#[async_trait]
impl NodeHandler for AiProcessorHandler {
    async fn execute(&self, ctx: NodeExecutionContext) -> NodeResult {
        let request = CompletionRequest::from_context(self.client.clone(), &ctx)?;
        let mut items = ctx.items(ReadOptions::default()).await?;
        tracing::info!("🤖 AI processor {} using model {}", ctx.node_id, request.model);

        let enriched: ItemStream = Box::pin(async_stream::try_stream! {
            while let Some(item) = items.next().await {
                let enriched = request.enrich(item?).await?;
                yield enriched;
            }
        });
        Ok(NodeOutput::Items(enriched))
    }
}
