//! `messages` payloads (chat-completions style).
//!
//! Tool calls arrive on assistant messages, either as
//! `tool_calls[].function.{name, arguments}` or as `tool_use` content blocks.
//! Results arrive as `tool` role messages keyed by `tool_call_id`, or as
//! `tool_result` blocks keyed by `tool_use_id`. Id matching is exact.

use serde_json::Value;
use std::collections::HashSet;

use super::capture::{Capturer, PositionalResolver};
use super::{ShapeMismatch, CHAT_PLACEHOLDER};

pub(crate) fn capture(messages: &[Value], capturer: &mut Capturer<'_>) {
    for message in messages {
        if message.get("role").and_then(Value::as_str) != Some("assistant") {
            continue;
        }

        if let Some(Value::Array(calls)) = message.get("tool_calls") {
            for call in calls {
                let Some(function) = call.get("function") else {
                    continue;
                };
                let Some(tool) = function.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let id = call.get("id").and_then(Value::as_str);
                capturer.record(tool, id, function.get("arguments"));
            }
        }

        if let Some(Value::Array(blocks)) = message.get("content") {
            for block in blocks {
                if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                    continue;
                }
                let Some(tool) = block.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let id = block.get("id").and_then(Value::as_str);
                capturer.record(tool, id, block.get("input"));
            }
        }
    }
}

/// Returns the number of outputs replaced.
pub(crate) fn filter(
    messages: &mut [Value],
    pruned: &HashSet<String>,
    resolver: &mut PositionalResolver<'_>,
) -> Result<usize, ShapeMismatch> {
    if let Some(index) = messages.iter().position(|m| !m.is_object()) {
        return Err(ShapeMismatch(format!("messages[{index}] is not an object")));
    }

    let mut replaced = 0;
    for message in messages.iter_mut() {
        match message.get("role").and_then(Value::as_str) {
            Some("assistant") => note_calls(message, resolver),
            Some("tool") => {
                let call_id = tool_message_call_id(message, resolver);
                if call_id.is_some_and(|id| pruned.contains(&id)) {
                    replaced += replace_field(message, "content");
                }
            }
            Some("user") => {
                if let Some(Value::Array(blocks)) = message.get_mut("content") {
                    for block in blocks.iter_mut() {
                        if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                            continue;
                        }
                        let call_id = block.get("tool_use_id").and_then(Value::as_str);
                        if let Some(tool) = resolver.tool_for(None, call_id) {
                            resolver.advance(&tool);
                        }
                        if call_id.is_some_and(|id| pruned.contains(id)) {
                            replaced += replace_field(block, "content");
                        }
                    }
                }
            }
            _ => {}
        }
    }
    Ok(replaced)
}

fn note_calls(message: &Value, resolver: &mut PositionalResolver<'_>) {
    if let Some(Value::Array(calls)) = message.get("tool_calls") {
        for call in calls {
            let id = call.get("id").and_then(Value::as_str);
            let tool = call.pointer("/function/name").and_then(Value::as_str);
            if let (Some(id), Some(tool)) = (id, tool) {
                resolver.note_call(id, tool);
            }
        }
    }
    if let Some(Value::Array(blocks)) = message.get("content") {
        for block in blocks {
            if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                continue;
            }
            let id = block.get("id").and_then(Value::as_str);
            let tool = block.get("name").and_then(Value::as_str);
            if let (Some(id), Some(tool)) = (id, tool) {
                resolver.note_call(id, tool);
            }
        }
    }
}

/// Every result advances its tool's occurrence counter, matching capture,
/// which counts every call whether or not it carries an id.
fn tool_message_call_id(
    message: &Value,
    resolver: &mut PositionalResolver<'_>,
) -> Option<String> {
    let explicit = message.get("tool_call_id").and_then(Value::as_str);
    let name = message.get("name").and_then(Value::as_str);
    let position = resolver.tool_for(name, explicit).map(|tool| {
        let index = resolver.advance(&tool);
        (tool, index)
    });

    match (explicit, position) {
        (Some(id), _) => Some(id.to_string()),
        (None, Some((tool, index))) => resolver.resolve(&tool, index),
        (None, None) => None,
    }
}

fn replace_field(item: &mut Value, field: &str) -> usize {
    let Some(object) = item.as_object_mut() else {
        return 0;
    };
    if object.get(field).and_then(Value::as_str) == Some(CHAT_PLACEHOLDER) {
        return 0;
    }
    object.insert(field.to_string(), Value::String(CHAT_PLACEHOLDER.to_string()));
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{PositionMap, ToolParamCache};
    use serde_json::json;

    fn ids(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_capture_reads_tool_calls_and_tool_use_blocks() {
        let params = ToolParamCache::new();
        let positions = PositionMap::new();
        let messages = vec![
            json!({"role": "assistant", "content": null, "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "read", "arguments": "{\"path\":\"a.rs\"}"}},
                {"id": "c2", "type": "function", "function": {"name": "read", "arguments": "oops"}}
            ]}),
            json!({"role": "assistant", "content": [
                {"type": "text", "text": "let me look"},
                {"type": "tool_use", "id": "toolu_1", "name": "grep", "input": {"pattern": "fn main"}}
            ]}),
            json!({"role": "user", "content": "not a call"}),
        ];

        let mut capturer = Capturer::new(&params, &positions, Some("s1"));
        capture(&messages, &mut capturer);

        assert_eq!(params.get("c1").unwrap().parameters, json!({"path": "a.rs"}));
        assert!(params.get("c2").is_none());
        assert_eq!(params.get("toolu_1").unwrap().tool, "grep");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_filter_replaces_tool_result_blocks() {
        let positions = PositionMap::new();
        let mut resolver = PositionalResolver::new(&positions, Some("s1"));
        let mut messages = vec![json!({"role": "user", "content": [
            {"type": "tool_result", "tool_use_id": "toolu_1", "content": "long output"},
            {"type": "tool_result", "tool_use_id": "toolu_2", "content": "keep"},
            {"type": "text", "text": "continue"}
        ]})];

        let replaced = filter(&mut messages, &ids(&["toolu_1"]), &mut resolver).unwrap();

        assert_eq!(replaced, 1);
        assert_eq!(messages[0]["content"][0]["content"], CHAT_PLACEHOLDER);
        assert_eq!(messages[0]["content"][1]["content"], "keep");
        assert_eq!(messages[0]["content"][2]["text"], "continue");
    }

    #[test]
    fn test_filter_resolves_id_less_results_by_position() {
        let params = ToolParamCache::new();
        let positions = PositionMap::new();
        let mut messages = vec![
            json!({"role": "assistant", "tool_calls": [
                {"type": "function", "function": {"name": "ls", "arguments": "{}"}},
                {"type": "function", "function": {"name": "ls", "arguments": "{\"dir\":\"src\"}"}}
            ]}),
            json!({"role": "tool", "name": "ls", "content": "first listing"}),
            json!({"role": "tool", "name": "ls", "content": "second listing"}),
        ];

        let mut capturer = Capturer::new(&params, &positions, Some("s1"));
        capture(&messages, &mut capturer);
        assert_eq!(params.get("pos:ls:1").unwrap().parameters, json!({"dir": "src"}));

        let mut resolver = PositionalResolver::new(&positions, Some("s1"));
        let replaced = filter(&mut messages, &ids(&["pos:ls:0"]), &mut resolver).unwrap();

        assert_eq!(replaced, 1);
        assert_eq!(messages[1]["content"], CHAT_PLACEHOLDER);
        assert_eq!(messages[2]["content"], "second listing");
    }

    #[test]
    fn test_filter_without_conversation_ignores_id_less_results() {
        let positions = PositionMap::new();
        let mut resolver = PositionalResolver::new(&positions, None);
        let mut messages = vec![json!({"role": "tool", "name": "ls", "content": "listing"})];

        let replaced = filter(&mut messages, &ids(&["pos:ls:0"]), &mut resolver).unwrap();
        assert_eq!(replaced, 0);
    }

    #[test]
    fn test_results_without_name_keep_positions_aligned() {
        let params = ToolParamCache::new();
        let positions = PositionMap::new();
        let mut messages = vec![
            json!({"role": "assistant", "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "ls", "arguments": "{}"}},
                {"type": "function", "function": {"name": "ls", "arguments": "{\"dir\":\"src\"}"}}
            ]}),
            json!({"role": "tool", "tool_call_id": "c1", "content": "first listing"}),
            json!({"role": "tool", "name": "ls", "content": "second listing"}),
        ];

        let mut capturer = Capturer::new(&params, &positions, Some("s1"));
        capture(&messages, &mut capturer);
        assert_eq!(positions.resolve("s1", "ls", 1).as_deref(), Some("pos:ls:1"));

        let mut resolver = PositionalResolver::new(&positions, Some("s1"));
        let replaced = filter(&mut messages, &ids(&["pos:ls:1"]), &mut resolver).unwrap();

        assert_eq!(replaced, 1);
        assert_eq!(messages[1]["content"], "first listing");
        assert_eq!(messages[2]["content"], CHAT_PLACEHOLDER);
    }
}
