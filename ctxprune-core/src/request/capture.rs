use serde_json::Value;
use std::collections::HashMap;

use crate::cache::{PositionCursor, PositionMap, ToolCallRecord, ToolParamCache};

/// Decodes tool arguments that providers send either as a JSON string or as
/// an inline object. Malformed strings yield `None`.
pub(crate) fn decode_arguments(raw: &Value) -> Option<Value> {
    match raw {
        Value::String(text) => serde_json::from_str(text).ok(),
        Value::Null => None,
        other => Some(other.clone()),
    }
}

/// Records the tool calls of one request into the correlation caches.
pub(crate) struct Capturer<'a> {
    params: &'a ToolParamCache,
    positions: &'a PositionMap,
    cursor: Option<PositionCursor>,
    order: HashMap<String, usize>,
}

impl<'a> Capturer<'a> {
    pub fn new(
        params: &'a ToolParamCache,
        positions: &'a PositionMap,
        conversation_id: Option<&str>,
    ) -> Self {
        Self {
            params,
            positions,
            cursor: conversation_id.map(|id| positions.begin_capture(id)),
            order: HashMap::new(),
        }
    }

    /// Calls without an id can only be correlated positionally, which needs
    /// a conversation; without one they are skipped.
    pub fn record(&mut self, tool: &str, call_id: Option<&str>, arguments: Option<&Value>) {
        let order = {
            let slot = self.order.entry(tool.to_string()).or_insert(0);
            let current = *slot;
            *slot += 1;
            current
        };

        let call_id = match (call_id, self.cursor.as_mut()) {
            (Some(id), Some(cursor)) => self.positions.assign_observed(cursor, tool, id),
            (Some(id), None) => id.to_string(),
            (None, Some(cursor)) => self.positions.assign(cursor, tool),
            (None, None) => return,
        };

        let Some(parameters) = arguments.and_then(decode_arguments) else {
            return;
        };
        self.params.put(ToolCallRecord {
            call_id,
            tool: tool.to_string(),
            parameters,
            order,
        });
    }
}

/// Maps id-less tool results back to call ids by occurrence order.
pub(crate) struct PositionalResolver<'a> {
    positions: &'a PositionMap,
    conversation_id: Option<&'a str>,
    seen: HashMap<String, usize>,
    tools_by_id: HashMap<String, String>,
}

impl<'a> PositionalResolver<'a> {
    pub fn new(positions: &'a PositionMap, conversation_id: Option<&'a str>) -> Self {
        Self {
            positions,
            conversation_id,
            seen: HashMap::new(),
            tools_by_id: HashMap::new(),
        }
    }

    /// Remembers the tool an id-bearing call invoked, for results that echo
    /// the id but not the tool name.
    pub fn note_call(&mut self, call_id: &str, tool: &str) {
        self.tools_by_id.insert(call_id.to_string(), tool.to_string());
    }

    /// The tool a result belongs to: its own `name`, else the tool of the
    /// call it answers.
    pub fn tool_for(&self, name: Option<&str>, call_id: Option<&str>) -> Option<String> {
        name.map(str::to_string)
            .or_else(|| self.tools_by_id.get(call_id?).cloned())
    }

    /// Advances the occurrence counter for `tool` even when the result
    /// carries its own id, so later id-less results stay aligned.
    pub fn advance(&mut self, tool: &str) -> usize {
        let slot = self.seen.entry(tool.to_string()).or_insert(0);
        let index = *slot;
        *slot += 1;
        index
    }

    pub fn resolve(&self, tool: &str, index: usize) -> Option<String> {
        self.positions.resolve(self.conversation_id?, tool, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_arguments() {
        assert_eq!(
            decode_arguments(&json!("{\"path\":\"a.rs\"}")),
            Some(json!({"path": "a.rs"}))
        );
        assert_eq!(decode_arguments(&json!({"k": 1})), Some(json!({"k": 1})));
        assert_eq!(decode_arguments(&json!("{not json")), None);
        assert_eq!(decode_arguments(&json!("")), None);
        assert_eq!(decode_arguments(&Value::Null), None);
    }

    #[test]
    fn test_malformed_arguments_leave_no_entry_but_keep_position() {
        let params = ToolParamCache::new();
        let positions = PositionMap::new();
        let mut capturer = Capturer::new(&params, &positions, Some("s1"));

        capturer.record("read", Some("c1"), Some(&json!("{broken")));
        capturer.record("read", Some("c2"), Some(&json!("{\"path\":\"b\"}")));

        assert!(params.get("c1").is_none());
        let second = params.get("c2").unwrap();
        assert_eq!(second.order, 1);
        assert_eq!(positions.resolve("s1", "read", 0).as_deref(), Some("c1"));
    }

    #[test]
    fn test_id_less_calls_need_a_conversation() {
        let params = ToolParamCache::new();
        let positions = PositionMap::new();

        Capturer::new(&params, &positions, None).record("glob", None, Some(&json!({})));
        assert!(params.is_empty());

        Capturer::new(&params, &positions, Some("s1")).record("glob", None, Some(&json!({})));
        assert!(params.get("pos:glob:0").is_some());
    }
}
