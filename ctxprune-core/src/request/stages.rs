use super::capture::{Capturer, PositionalResolver};
use super::{chat, structured, RequestEnvelope, RewritePass, RewriteStage, ShapeMismatch};
use crate::cache::{ModelInfo, ModelInfoCache, PositionMap, ToolParamCache};

/// Records tool calls, their parameters and the request's model. Never fails
/// and never mutates the document.
pub struct CaptureStage {
    params: ToolParamCache,
    models: ModelInfoCache,
    positions: PositionMap,
}

impl CaptureStage {
    pub fn new(params: ToolParamCache, models: ModelInfoCache, positions: PositionMap) -> Self {
        Self {
            params,
            models,
            positions,
        }
    }
}

impl RewriteStage for CaptureStage {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn apply(
        &self,
        envelope: &mut RequestEnvelope<'_>,
        pass: &mut RewritePass<'_>,
    ) -> Result<(), ShapeMismatch> {
        let Some(format) = envelope.format() else {
            return Ok(());
        };
        if let (Some(conversation_id), Some(model)) = (pass.conversation_id, &pass.model) {
            self.models.put(
                conversation_id,
                ModelInfo {
                    model: model.clone(),
                    format,
                },
            );
        }

        let mut capturer = Capturer::new(&self.params, &self.positions, pass.conversation_id);
        match envelope {
            RequestEnvelope::ChatMessages(messages) => chat::capture(messages, &mut capturer),
            RequestEnvelope::StructuredInput(items) => structured::capture(items, &mut capturer),
            RequestEnvelope::Passthrough => {}
        }
        Ok(())
    }
}

/// Replaces the outputs of pruned calls with the format's placeholder.
pub struct FilterStage {
    positions: PositionMap,
}

impl FilterStage {
    pub fn new(positions: PositionMap) -> Self {
        Self { positions }
    }
}

impl RewriteStage for FilterStage {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn apply(
        &self,
        envelope: &mut RequestEnvelope<'_>,
        pass: &mut RewritePass<'_>,
    ) -> Result<(), ShapeMismatch> {
        if pass.pruned.is_empty() {
            return Ok(());
        }
        let replaced = match envelope {
            RequestEnvelope::ChatMessages(messages) => {
                let mut resolver = PositionalResolver::new(&self.positions, pass.conversation_id);
                chat::filter(messages, pass.pruned, &mut resolver)?
            }
            RequestEnvelope::StructuredInput(items) => structured::filter(items, pass.pruned)?,
            RequestEnvelope::Passthrough => 0,
        };
        pass.replaced += replaced;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::PayloadFormat;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_capture_records_model_only_with_conversation() {
        let models = ModelInfoCache::new();
        let stage = CaptureStage::new(ToolParamCache::new(), models.clone(), PositionMap::new());
        let pruned = HashSet::new();
        let mut document = json!({"model": "gpt-5", "input": []});

        for conversation_id in [None, Some("s1")] {
            let mut envelope = RequestEnvelope::detect(&mut document);
            let mut pass = RewritePass {
                conversation_id,
                pruned: &pruned,
                model: Some("gpt-5".to_string()),
                replaced: 0,
            };
            stage.apply(&mut envelope, &mut pass).unwrap();
        }

        let info = models.get("s1").unwrap();
        assert_eq!(info.model, "gpt-5");
        assert_eq!(info.format, PayloadFormat::StructuredInput);
    }

    #[test]
    fn test_filter_skips_structure_checks_when_nothing_is_pruned() {
        let stage = FilterStage::new(PositionMap::new());
        let pruned = HashSet::new();
        let mut document = json!({"messages": [1, 2, 3]});
        let mut envelope = RequestEnvelope::detect(&mut document);
        let mut pass = RewritePass {
            conversation_id: None,
            pruned: &pruned,
            model: None,
            replaced: 0,
        };

        assert!(stage.apply(&mut envelope, &mut pass).is_ok());
        assert_eq!(pass.replaced, 0);
    }
}
