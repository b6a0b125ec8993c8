//! Correlation caches filled while requests flow through the chain.
//!
//! None of these are authoritative state: they remember what outgoing requests
//! looked like so the janitor can reason about calls whose arguments the
//! transcript does not carry.

mod position;

pub use position::{PositionCursor, PositionMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::request::PayloadFormat;

/// A tool invocation seen in an outgoing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool: String,
    pub parameters: Value,
    /// Occurrence index among calls to the same tool in the same request
    /// history, in order of appearance.
    pub order: usize,
}

/// Call id → last captured invocation. Call ids are opaque and unique across
/// conversations, so the cache is not partitioned.
#[derive(Clone, Default)]
pub struct ToolParamCache {
    inner: Arc<Mutex<HashMap<String, ToolCallRecord>>>,
}

impl ToolParamCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, record: ToolCallRecord) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.call_id.clone(), record);
    }

    pub fn get(&self, call_id: &str) -> Option<ToolCallRecord> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).get(call_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model: String,
    pub format: PayloadFormat,
}

/// Conversation id → model most recently used for it.
#[derive(Clone, Default)]
pub struct ModelInfoCache {
    inner: Arc<Mutex<HashMap<String, ModelInfo>>>,
}

impl ModelInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, conversation_id: &str, info: ModelInfo) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conversation_id.to_string(), info);
    }

    pub fn get(&self, conversation_id: &str) -> Option<ModelInfo> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).get(conversation_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, path: &str) -> ToolCallRecord {
        ToolCallRecord {
            call_id: id.to_string(),
            tool: "read".to_string(),
            parameters: json!({ "path": path }),
            order: 0,
        }
    }

    #[test]
    fn test_put_overwrites_and_get_misses_unseen() {
        let cache = ToolParamCache::new();
        assert!(cache.get("c1").is_none());

        cache.put(record("c1", "a.rs"));
        cache.put(record("c1", "a.rs"));
        assert_eq!(cache.len(), 1);

        cache.put(record("c1", "b.rs"));
        assert_eq!(cache.get("c1").unwrap().parameters, json!({"path": "b.rs"}));
    }

    #[test]
    fn test_clones_share_state() {
        let cache = ModelInfoCache::new();
        let other = cache.clone();
        other.put(
            "s1",
            ModelInfo {
                model: "gpt-5".to_string(),
                format: PayloadFormat::StructuredInput,
            },
        );
        assert_eq!(cache.get("s1").unwrap().model, "gpt-5");
        assert!(cache.get("s2").is_none());
    }
}
