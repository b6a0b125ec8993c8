//! The explicit pruning context. Everything the chain, the janitor and the
//! service share hangs off one [`PruneContext`]; there is no process-global
//! state.

use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::cache::{ModelInfoCache, PositionMap, ToolParamCache};
use crate::host::{
    ConversationDirectory, PrunedHistory, SnapshotSink, TranscriptEntry, TranscriptSource,
};
use crate::janitor::StatsRegistry;
use crate::mock::{InMemoryDirectory, InMemoryHistory, InMemoryTranscripts};
use crate::request::Pipeline;
use crate::settings::{PruneSettings, SettingsManager};
use crate::store::PrunedIdStore;

pub struct PruneContext {
    pub settings: SettingsManager,
    pub tool_params: ToolParamCache,
    pub models: ModelInfoCache,
    pub positions: PositionMap,
    pub store: PrunedIdStore,
    pub stats: StatsRegistry,
    pub pipeline: Pipeline,
    pub directory: Arc<dyn ConversationDirectory>,
    pub transcripts: Arc<dyn TranscriptSource>,
    pub snapshots: Option<Arc<dyn SnapshotSink>>,
}

impl PruneContext {
    pub fn builder() -> PruneContextBuilder {
        PruneContextBuilder::new()
    }

    /// Writes a snapshot when debug snapshots are enabled and a sink is
    /// configured. Sink failures are logged only.
    pub async fn snapshot(
        &self,
        label: &str,
        body: Option<&Value>,
        transcript: Option<&[TranscriptEntry]>,
    ) {
        let Some(sink) = &self.snapshots else {
            return;
        };
        if !self.settings.settings().debug.snapshots {
            return;
        }
        if let Err(e) = sink.snapshot(label, body, transcript).await {
            warn!(?e, label, "Failed to write snapshot");
        }
    }
}

/// Collaborators left unset fall back to empty in-memory implementations,
/// and settings to in-memory defaults.
#[derive(Default)]
pub struct PruneContextBuilder {
    settings: Option<SettingsManager>,
    directory: Option<Arc<dyn ConversationDirectory>>,
    transcripts: Option<Arc<dyn TranscriptSource>>,
    history: Option<Arc<dyn PrunedHistory>>,
    snapshots: Option<Arc<dyn SnapshotSink>>,
}

impl PruneContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(mut self, settings: SettingsManager) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn ConversationDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn transcripts(mut self, transcripts: Arc<dyn TranscriptSource>) -> Self {
        self.transcripts = Some(transcripts);
        self
    }

    pub fn history(mut self, history: Arc<dyn PrunedHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn snapshots(mut self, snapshots: Arc<dyn SnapshotSink>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn build(self) -> Arc<PruneContext> {
        let settings = self
            .settings
            .unwrap_or_else(|| SettingsManager::ephemeral(PruneSettings::default()));
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(InMemoryDirectory::new()));
        let transcripts = self
            .transcripts
            .unwrap_or_else(|| Arc::new(InMemoryTranscripts::new()));
        let history = self
            .history
            .unwrap_or_else(|| Arc::new(InMemoryHistory::new()));

        let tool_params = ToolParamCache::new();
        let models = ModelInfoCache::new();
        let positions = PositionMap::new();
        let pipeline = Pipeline::standard(tool_params.clone(), models.clone(), positions.clone());

        Arc::new(PruneContext {
            settings,
            tool_params,
            models,
            positions,
            store: PrunedIdStore::new(history, directory.clone()),
            stats: StatsRegistry::new(),
            pipeline,
            directory,
            transcripts,
            snapshots: self.snapshots,
        })
    }
}
