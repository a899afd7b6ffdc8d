/// External-call node
///
/// Issues one HTTP request built from node config and hands the response
/// body downstream as a lazy byte stream. The orchestrator persists it
/// verbatim, so large payloads never sit in memory.

use super::{NodeExecutionContext, NodeHandler, NodeOutput, NodeResult};
use crate::error::PipelineError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Method;
use serde_json::Value;

/// Cap on how much of an error body ends up in the execution log
const ERROR_BODY_LIMIT: usize = 2048;

#[derive(Debug, Clone)]
pub struct ExternalCallHandler {
    client: reqwest::Client,
}

impl ExternalCallHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn parse_method(raw: &str) -> Result<Method, PipelineError> {
    match raw.to_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "DELETE" => Ok(Method::DELETE),
        "PATCH" => Ok(Method::PATCH),
        "HEAD" => Ok(Method::HEAD),
        other => Err(PipelineError::config(format!("unsupported HTTP method '{}'", other))),
    }
}

pub(crate) fn truncate_body(body: &str) -> String {
    if body.chars().count() <= ERROR_BODY_LIMIT {
        return body.to_string();
    }
    let mut cut: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    cut.push_str("...");
    cut
}

/// Turn a non-2xx response into an `ExternalCall` error carrying its body
pub(crate) async fn error_for_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response, PipelineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PipelineError::external(format!(
        "{} returned HTTP {}: {}",
        what,
        status.as_u16(),
        truncate_body(&body)
    )))
}

#[async_trait]
impl NodeHandler for ExternalCallHandler {
    async fn execute(&self, ctx: NodeExecutionContext) -> NodeResult {
        let url = ctx.require_str("url")?;
        let method = parse_method(ctx.str_field("method").unwrap_or("GET"))?;

        let mut request = self.client.request(method.clone(), url);

        if let Some(headers) = ctx.config.get("headers").and_then(|h| h.as_object()) {
            for (key, value) in headers {
                if let Some(header_value) = value.as_str() {
                    request = request.header(key.as_str(), header_value);
                }
            }
        }

        if let Some(query) = ctx.config.get("query").and_then(|q| q.as_object()) {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k.clone(), s.clone()),
                    other => (k.clone(), other.to_string()),
                })
                .collect();
            request = request.query(&pairs);
        }

        match ctx.config.get("body") {
            Some(body @ (Value::Object(_) | Value::Array(_))) => request = request.json(body),
            Some(Value::String(text)) => {
                request = request.header("Content-Type", "text/plain").body(text.clone());
            }
            _ => {}
        }

        tracing::info!("🌐 {} {} (node {})", method, url, ctx.node_id);
        let response = request.send().await?;
        let response = error_for_status(response, &format!("{} {}", method, url)).await?;
        tracing::debug!("📡 {} responded {}", url, response.status());

        let body = response.bytes_stream().map(|chunk| chunk.map_err(PipelineError::from));
        Ok(NodeOutput::Bytes(Box::pin(body)))
    }
}
