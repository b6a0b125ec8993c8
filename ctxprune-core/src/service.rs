//! Host-facing entry points: wrapping senders when conversations open and
//! reacting to idle signals.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::chain::{PruningSender, Scope, SenderSlot};
use crate::context::PruneContext;
use crate::error::PruneError;
use crate::janitor::{Admission, Janitor, RunReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AttachOutcome {
    Installed,
    AlreadyInstalled,
    Subagent,
    Disabled,
    LookupFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    Submitted(Admission),
    Subagent,
    Disabled,
    LookupFailed,
}

enum Lookup {
    Eligible,
    Subagent,
    Failed,
}

pub struct PruneService {
    ctx: Arc<PruneContext>,
    janitor: Janitor,
}

impl PruneService {
    pub fn new(ctx: Arc<PruneContext>) -> Self {
        let janitor = Janitor::from_settings(ctx.clone());
        Self { ctx, janitor }
    }

    pub fn context(&self) -> &Arc<PruneContext> {
        &self.ctx
    }

    pub fn janitor(&self) -> &Janitor {
        &self.janitor
    }

    fn enabled(&self) -> bool {
        self.ctx.settings.settings().enabled
    }

    async fn lookup(&self, conversation_id: &str) -> Lookup {
        match self.ctx.directory.get(conversation_id).await {
            Ok(info) if info.is_subagent() => Lookup::Subagent,
            Ok(_) => Lookup::Eligible,
            Err(e) => {
                warn!(?e, conversation_id, "Conversation lookup failed");
                Lookup::Failed
            }
        }
    }

    /// Wraps the process-level sender with the global fast path. Returns
    /// false when disabled by settings or already installed.
    pub fn install_global(&self, slot: &SenderSlot) -> bool {
        let settings = self.ctx.settings.settings();
        if !settings.enabled || !settings.global_fast_path {
            return false;
        }
        PruningSender::install(slot, Scope::Global, self.ctx.clone())
    }

    /// Wraps a conversation's sender. Subagents and conversations that cannot
    /// be looked up are left unwrapped.
    pub async fn attach(&self, slot: &SenderSlot, conversation_id: &str) -> AttachOutcome {
        if !self.enabled() {
            return AttachOutcome::Disabled;
        }
        let outcome = match self.lookup(conversation_id).await {
            Lookup::Subagent => AttachOutcome::Subagent,
            Lookup::Failed => AttachOutcome::LookupFailed,
            Lookup::Eligible => {
                let scope = Scope::Conversation(conversation_id.to_string());
                if PruningSender::install(slot, scope, self.ctx.clone()) {
                    AttachOutcome::Installed
                } else {
                    AttachOutcome::AlreadyInstalled
                }
            }
        };
        debug!(conversation_id, %outcome, "Attach");
        outcome
    }

    pub async fn on_idle(&self, conversation_id: &str) -> IdleOutcome {
        if !self.enabled() {
            return IdleOutcome::Disabled;
        }
        match self.lookup(conversation_id).await {
            Lookup::Subagent => {
                debug!(conversation_id, "Ignoring idle signal from subagent");
                IdleOutcome::Subagent
            }
            Lookup::Failed => IdleOutcome::LookupFailed,
            Lookup::Eligible => IdleOutcome::Submitted(self.janitor.submit(conversation_id)),
        }
    }

    /// Foreground janitor pass. `None` for subagents.
    pub async fn run_now(&self, conversation_id: &str) -> Result<Option<RunReport>, PruneError> {
        let info = self.ctx.directory.get(conversation_id).await?;
        if info.is_subagent() {
            return Ok(None);
        }
        self.janitor.run(conversation_id).await.map(Some)
    }

    pub async fn shutdown(&self) {
        self.janitor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PruneContextBuilder;
    use crate::host::ConversationInfo;
    use crate::mock::{InMemoryDirectory, InMemoryTranscripts, RecordingSender};
    use crate::settings::{PruneSettings, SettingsManager};

    fn build_service(settings: PruneSettings) -> (PruneService, InMemoryTranscripts) {
        let directory = InMemoryDirectory::new();
        directory.add(ConversationInfo::new("s1"));
        directory.add(ConversationInfo::child_of("sub", "s1"));
        directory.fail_get_for("gone");
        let transcripts = InMemoryTranscripts::new();
        let ctx = PruneContextBuilder::new()
            .settings(SettingsManager::ephemeral(settings))
            .directory(Arc::new(directory))
            .transcripts(Arc::new(transcripts.clone()))
            .build();
        (PruneService::new(ctx), transcripts)
    }

    fn slot() -> SenderSlot {
        SenderSlot::new(Arc::new(RecordingSender::default()))
    }

    #[tokio::test]
    async fn test_attach_outcomes() {
        let (service, _) = build_service(PruneSettings::default());
        let slot = slot();

        assert_eq!(service.attach(&slot, "s1").await, AttachOutcome::Installed);
        assert_eq!(service.attach(&slot, "s1").await, AttachOutcome::AlreadyInstalled);
        assert_eq!(service.attach(&slot, "sub").await, AttachOutcome::Subagent);
        assert_eq!(service.attach(&slot, "gone").await, AttachOutcome::LookupFailed);
        assert_eq!(
            slot.installed_scopes(),
            vec![Scope::Conversation("s1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_disabled_service_does_nothing() {
        let settings = PruneSettings {
            enabled: false,
            ..Default::default()
        };
        let (service, transcripts) = build_service(settings);
        let slot = slot();

        assert!(!service.install_global(&slot));
        assert_eq!(service.attach(&slot, "s1").await, AttachOutcome::Disabled);
        assert_eq!(service.on_idle("s1").await, IdleOutcome::Disabled);
        service.shutdown().await;

        assert!(slot.installed_scopes().is_empty());
        assert_eq!(transcripts.fetch_count("s1"), 0);
    }

    #[tokio::test]
    async fn test_idle_from_subagent_never_runs_janitor() {
        let (service, transcripts) = build_service(PruneSettings::default());

        for _ in 0..3 {
            assert_eq!(service.on_idle("sub").await, IdleOutcome::Subagent);
        }
        assert_eq!(
            service.on_idle("s1").await,
            IdleOutcome::Submitted(Admission::Accepted)
        );
        service.shutdown().await;

        assert_eq!(transcripts.fetch_count("sub"), 0);
        assert_eq!(transcripts.fetch_count("s1"), 1);
        assert_eq!(service.run_now("sub").await.unwrap(), None);
    }

    #[test]
    fn test_global_install_respects_fast_path_setting() {
        let settings = PruneSettings {
            global_fast_path: false,
            ..Default::default()
        };
        let (service, _) = build_service(settings);
        assert!(!service.install_global(&slot()));

        let (service, _) = build_service(PruneSettings::default());
        let slot = slot();
        assert!(service.install_global(&slot));
        assert!(!service.install_global(&slot));
    }
}
