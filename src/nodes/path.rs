/// Field paths into JSON items
///
/// Node configs address item fields either as dotted paths (`customer.name`,
/// `lines.0.sku`) or as raw JSONPath (`$.lines[*].sku`). Dotted paths are
/// compiled to bracket-notation JSONPath once, then resolved per item with
/// jsonpath_lib.

use crate::error::{PipelineError, PipelineResult};
use serde_json::{Map, Value};

/// A compiled field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    selector: String,
}

impl FieldPath {
    pub fn compile(raw: &str) -> PipelineResult<Self> {
        let selector = to_selector(raw);
        // Surface malformed selectors at config time rather than on the first item
        jsonpath_lib::select(&Value::Null, &selector)
            .map_err(|e| PipelineError::Parse(format!("invalid field path '{}': {:?}", raw, e)))?;
        Ok(Self {
            raw: raw.to_string(),
            selector,
        })
    }

    /// First value at this path, `None` when nothing matches
    pub fn resolve(&self, item: &Value) -> PipelineResult<Option<Value>> {
        let matches = jsonpath_lib::select(item, &self.selector)
            .map_err(|e| PipelineError::Parse(format!("field path '{}' failed: {:?}", self.raw, e)))?;
        Ok(matches.into_iter().next().cloned())
    }
}

fn to_selector(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('$') {
        return trimmed.to_string();
    }

    let mut selector = String::from("$");
    for segment in trimmed.split('.').filter(|s| !s.is_empty()) {
        if segment.chars().all(|c| c.is_ascii_digit()) {
            selector.push('[');
            selector.push_str(segment);
            selector.push(']');
        } else {
            selector.push_str("['");
            selector.push_str(&segment.replace('\'', "\\'"));
            selector.push_str("']");
        }
    }
    selector
}

/// Set `value` at a dotted `target` inside `object`, creating intermediate objects
pub fn set_dotted(object: &mut Map<String, Value>, target: &str, value: Value) {
    let mut segments = target.split('.').filter(|s| !s.is_empty()).peekable();
    let mut current = object;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => return,
        };
    }
}
