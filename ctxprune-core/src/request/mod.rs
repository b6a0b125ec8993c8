//! Request normalization and rewriting.
//!
//! Outgoing bodies are classified into a closed set of shapes. Recognized
//! shapes run through an ordered [`Pipeline`] of rewrite stages (capture,
//! then filter). Everything else passes through untouched.

mod capture;
mod chat;
mod stages;
mod structured;

pub use stages::{CaptureStage, FilterStage};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::{ModelInfoCache, PositionMap, ToolParamCache};

/// Replaces the `content` of pruned tool messages in `messages` payloads.
pub const CHAT_PLACEHOLDER: &str =
    "[Output removed to save context - information superseded or no longer needed]";

/// Replaces the `output` of pruned `function_call_output` items in `input`
/// payloads.
pub const STRUCTURED_PLACEHOLDER: &str =
    "[Tool output pruned to save context - superseded or no longer needed]";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PayloadFormat {
    /// `{"messages": [{"role": ..., "content": ...}, ...]}`
    ChatMessages,
    /// `{"input": [{"type": ..., ...}, ...]}`
    StructuredInput,
}

/// A request body classified by shape, borrowing its item list.
pub enum RequestEnvelope<'a> {
    ChatMessages(&'a mut Vec<Value>),
    StructuredInput(&'a mut Vec<Value>),
    Passthrough,
}

impl<'a> RequestEnvelope<'a> {
    /// `messages` wins over `input` when both are arrays.
    pub fn detect(document: &'a mut Value) -> Self {
        let Some(object) = document.as_object_mut() else {
            return Self::Passthrough;
        };
        let key = if matches!(object.get("messages"), Some(Value::Array(_))) {
            "messages"
        } else if matches!(object.get("input"), Some(Value::Array(_))) {
            "input"
        } else {
            return Self::Passthrough;
        };
        let is_chat = key == "messages";
        match (object.get_mut(key), is_chat) {
            (Some(Value::Array(items)), true) => Self::ChatMessages(items),
            (Some(Value::Array(items)), false) => Self::StructuredInput(items),
            _ => Self::Passthrough,
        }
    }

    pub fn format(&self) -> Option<PayloadFormat> {
        match self {
            Self::ChatMessages(_) => Some(PayloadFormat::ChatMessages),
            Self::StructuredInput(_) => Some(PayloadFormat::StructuredInput),
            Self::Passthrough => None,
        }
    }
}

/// Read-only shape probe with the same precedence as [`RequestEnvelope::detect`].
pub fn detect_format(document: &Value) -> Option<PayloadFormat> {
    if matches!(document.get("messages"), Some(Value::Array(_))) {
        Some(PayloadFormat::ChatMessages)
    } else if matches!(document.get("input"), Some(Value::Array(_))) {
        Some(PayloadFormat::StructuredInput)
    } else {
        None
    }
}

/// The document did not have the structure its detected shape requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch(pub String);

/// Mutable state shared by the stages of one pipeline run.
pub struct RewritePass<'a> {
    pub conversation_id: Option<&'a str>,
    pub pruned: &'a HashSet<String>,
    /// The top-level `model` field, if the body carried one.
    pub model: Option<String>,
    pub replaced: usize,
}

pub trait RewriteStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(
        &self,
        envelope: &mut RequestEnvelope<'_>,
        pass: &mut RewritePass<'_>,
    ) -> Result<(), ShapeMismatch>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewriteOutcome {
    pub document: Value,
    pub format: Option<PayloadFormat>,
    pub modified: bool,
    pub replaced: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BodyOutcome<'b> {
    pub body: Cow<'b, str>,
    pub format: Option<PayloadFormat>,
    pub modified: bool,
    pub replaced: usize,
}

/// Ordered rewrite stages, composed once and shared by every sender.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn RewriteStage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn RewriteStage>>) -> Self {
        Self { stages }
    }

    /// Capture followed by filter.
    pub fn standard(
        params: ToolParamCache,
        models: ModelInfoCache,
        positions: PositionMap,
    ) -> Self {
        Self::new(vec![
            Arc::new(CaptureStage::new(params, models, positions.clone())),
            Arc::new(FilterStage::new(positions)),
        ])
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Rewrites a copy of `document`; the input is never mutated.
    pub fn rewrite_document(
        &self,
        document: &Value,
        conversation_id: Option<&str>,
        pruned: &HashSet<String>,
    ) -> RewriteOutcome {
        let unmodified = |format| RewriteOutcome {
            document: document.clone(),
            format,
            modified: false,
            replaced: 0,
        };

        let mut working = document.clone();
        let model = working
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut envelope = RequestEnvelope::detect(&mut working);
        let Some(format) = envelope.format() else {
            return unmodified(None);
        };

        let mut pass = RewritePass {
            conversation_id,
            pruned,
            model,
            replaced: 0,
        };
        for stage in &self.stages {
            if let Err(ShapeMismatch(reason)) = stage.apply(&mut envelope, &mut pass) {
                tracing::debug!(stage = stage.name(), %reason, "Leaving request unmodified");
                return unmodified(Some(format));
            }
        }

        let replaced = pass.replaced;
        RewriteOutcome {
            document: working,
            format: Some(format),
            modified: replaced > 0,
            replaced,
        }
    }

    /// Text-level entry point. Returns the original text, byte for byte,
    /// unless at least one output was replaced.
    pub fn rewrite_body<'b>(
        &self,
        body: &'b str,
        conversation_id: Option<&str>,
        pruned: &HashSet<String>,
    ) -> BodyOutcome<'b> {
        let unmodified = |format| BodyOutcome {
            body: Cow::Borrowed(body),
            format,
            modified: false,
            replaced: 0,
        };

        let Ok(document) = serde_json::from_str::<Value>(body) else {
            return unmodified(None);
        };
        let outcome = self.rewrite_document(&document, conversation_id, pruned);
        if !outcome.modified {
            return unmodified(outcome.format);
        }
        match serde_json::to_string(&outcome.document) {
            Ok(text) => BodyOutcome {
                body: Cow::Owned(text),
                format: outcome.format,
                modified: true,
                replaced: outcome.replaced,
            },
            Err(_) => unmodified(outcome.format),
        }
    }
}
