//! Positional correlation for tool calls whose results do not echo an id.
//!
//! Some providers identify a tool result only by tool name and the order in
//! which it appears. Every request re-sends the whole history, so the n-th
//! call to a tool in a conversation is stable across requests and can be
//! bound to a call id once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

type SlotKey = (String, String);

/// (conversation, tool, occurrence index) → call id.
#[derive(Clone, Default)]
pub struct PositionMap {
    slots: Arc<Mutex<HashMap<SlotKey, Vec<String>>>>,
}

/// Per-pass occurrence counters. Each capture pass owns its cursor, so
/// overlapping requests for the same conversation do not disturb each other.
#[derive(Debug)]
pub struct PositionCursor {
    conversation_id: String,
    next: HashMap<String, usize>,
}

impl PositionCursor {
    fn advance(&mut self, tool: &str) -> usize {
        let slot = self.next.entry(tool.to_string()).or_insert(0);
        let index = *slot;
        *slot += 1;
        index
    }
}

impl PositionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_capture(&self, conversation_id: &str) -> PositionCursor {
        PositionCursor {
            conversation_id: conversation_id.to_string(),
            next: HashMap::new(),
        }
    }

    /// Returns the id bound to the next occurrence of `tool`, minting a
    /// synthetic `pos:<tool>:<index>` id the first time the slot is seen.
    pub fn assign(&self, cursor: &mut PositionCursor, tool: &str) -> String {
        let index = cursor.advance(tool);
        let key = (cursor.conversation_id.clone(), tool.to_string());
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let bound = slots.entry(key).or_default();
        if let Some(existing) = bound.get(index) {
            return existing.clone();
        }
        let id = format!("pos:{tool}:{index}");
        bound.push(id.clone());
        id
    }

    /// Binds an id the payload did provide to the next occurrence of `tool`.
    pub fn assign_observed(
        &self,
        cursor: &mut PositionCursor,
        tool: &str,
        call_id: &str,
    ) -> String {
        let index = cursor.advance(tool);
        let key = (cursor.conversation_id.clone(), tool.to_string());
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let bound = slots.entry(key).or_default();
        match bound.get_mut(index) {
            Some(existing) => *existing = call_id.to_string(),
            None => bound.push(call_id.to_string()),
        }
        call_id.to_string()
    }

    pub fn resolve(&self, conversation_id: &str, tool: &str, index: usize) -> Option<String> {
        let key = (conversation_id.to_string(), tool.to_string());
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).get(&key)?.get(index).cloned()
    }
}
