/// Debug-mode sampling
///
/// When a run has debug mode on, the orchestrator keeps a small sample of
/// what each node consumed and produced: at most `MAX_SAMPLE_ITEMS` items
/// per direction, each shrunk to a `MAX_SAMPLE_CHARS` string when its JSON
/// form is longer. Sampling reads persisted files lazily and stops early,
/// so it stays bounded no matter how large the data is.

use crate::nodes::NodeInput;
use crate::stream::{open_items_chain, ReadOptions};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const MAX_SAMPLE_ITEMS: usize = 5;
pub const MAX_SAMPLE_CHARS: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DebugSample {
    pub input: Vec<Value>,
    pub output: Vec<Value>,
}

/// nodeId -> sample
pub type DebugSamples = BTreeMap<String, DebugSample>;

/// The item itself if its JSON is short enough, else a truncated JSON string
pub fn shrink(item: &Value) -> Value {
    let encoded = item.to_string();
    if encoded.chars().count() <= MAX_SAMPLE_CHARS {
        item.clone()
    } else {
        Value::String(encoded.chars().take(MAX_SAMPLE_CHARS).collect())
    }
}

/// First items of some persisted files; unreadable data ends the sample early
pub async fn sample_files(files: Vec<PathBuf>) -> Vec<Value> {
    if files.is_empty() {
        return Vec::new();
    }
    let mut items = match open_items_chain(files, ReadOptions::default()).await {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!("⚠️ Debug sampling skipped: {}", e);
            return Vec::new();
        }
    };

    let mut sample = Vec::with_capacity(MAX_SAMPLE_ITEMS);
    while sample.len() < MAX_SAMPLE_ITEMS {
        match items.next().await {
            Some(Ok(item)) => sample.push(shrink(&item)),
            Some(Err(e)) => {
                tracing::warn!("⚠️ Debug sampling stopped early: {}", e);
                break;
            }
            None => break,
        }
    }
    sample
}

/// Sample of a node's upstream references; summaries count as one item each
pub async fn sample_inputs(inputs: &[NodeInput]) -> Vec<Value> {
    let mut files = Vec::new();
    let mut summaries = Vec::new();
    for input in inputs {
        match input {
            NodeInput::File(path) => files.push(path.clone()),
            NodeInput::Summary(map) => summaries.push(shrink(&Value::Object(map.clone()))),
        }
    }
    let mut sample = sample_files(files).await;
    sample.extend(summaries);
    sample.truncate(MAX_SAMPLE_ITEMS);
    sample
}
