//! `input` payloads (responses style): a flat list of typed items.
//!
//! Calls are `function_call` items, results are `function_call_output`
//! items. Providers are inconsistent about the case of `call_id`, so ids are
//! compared lower-cased.

use serde_json::Value;
use std::collections::HashSet;

use super::capture::Capturer;
use super::{ShapeMismatch, STRUCTURED_PLACEHOLDER};

pub(crate) fn capture(items: &[Value], capturer: &mut Capturer<'_>) {
    for item in items {
        if item.get("type").and_then(Value::as_str) != Some("function_call") {
            continue;
        }
        let Some(tool) = item.get("name").and_then(Value::as_str) else {
            continue;
        };
        let id = item
            .get("call_id")
            .and_then(Value::as_str)
            .map(str::to_lowercase);
        capturer.record(tool, id.as_deref(), item.get("arguments"));
    }
}

pub(crate) fn filter(
    items: &mut [Value],
    pruned: &HashSet<String>,
) -> Result<usize, ShapeMismatch> {
    if let Some(index) = items.iter().position(|i| !i.is_object()) {
        return Err(ShapeMismatch(format!("input[{index}] is not an object")));
    }

    let pruned: HashSet<String> = pruned.iter().map(|id| id.to_lowercase()).collect();
    let mut replaced = 0;
    for item in items.iter_mut() {
        if item.get("type").and_then(Value::as_str) != Some("function_call_output") {
            continue;
        }
        let matched = item
            .get("call_id")
            .and_then(Value::as_str)
            .is_some_and(|id| pruned.contains(&id.to_lowercase()));
        if !matched {
            continue;
        }
        let Some(object) = item.as_object_mut() else {
            continue;
        };
        if object.get("output").and_then(Value::as_str) == Some(STRUCTURED_PLACEHOLDER) {
            continue;
        }
        object.insert(
            "output".to_string(),
            Value::String(STRUCTURED_PLACEHOLDER.to_string()),
        );
        replaced += 1;
    }
    Ok(replaced)
}
