use anyhow::{Context, Result};
use ctxprune_core::host::{RequestOptions, RequestSender, SenderResponse};
use ctxprune_core::persistence::{FileConversationStore, FileSnapshotSink, JsonPrunedHistory};
use ctxprune_core::settings::settings_json_schema;
use ctxprune_core::{PruneContext, PruneError, PruneService, SenderSlot, SettingsManager};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Terminal sender for the CLI: keeps the body it was handed.
#[derive(Default)]
struct CapturingSender {
    body: Mutex<Option<String>>,
}

impl CapturingSender {
    fn take(&self) -> Option<String> {
        self.body.lock().unwrap().take()
    }
}

#[async_trait::async_trait]
impl RequestSender for CapturingSender {
    async fn send(
        &self,
        _target: &str,
        options: RequestOptions,
    ) -> Result<SenderResponse, PruneError> {
        *self.body.lock().unwrap() = options.body;
        Ok(SenderResponse {
            status: 200,
            body: String::new(),
        })
    }
}

pub fn build_context(data_dir: &Path, settings_path: PathBuf) -> Result<Arc<PruneContext>> {
    let settings = SettingsManager::from_path(settings_path)?;
    let snapshot_dir = settings
        .settings()
        .debug
        .snapshot_dir
        .unwrap_or_else(|| data_dir.join("snapshots"));

    let conversations = Arc::new(FileConversationStore::new(data_dir)?);
    let history = Arc::new(JsonPrunedHistory::new(data_dir)?);

    Ok(PruneContext::builder()
        .settings(settings)
        .directory(conversations.clone())
        .transcripts(conversations)
        .history(history)
        .snapshots(Arc::new(FileSnapshotSink::new(snapshot_dir)))
        .build())
}

fn read_body(file: Option<PathBuf>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read request body from {path:?}")),
        None => {
            let mut body = String::new();
            std::io::stdin()
                .read_to_string(&mut body)
                .context("failed to read request body from stdin")?;
            Ok(body)
        }
    }
}

/// Pushes the body through the same interception chain a host would install.
pub async fn rewrite(
    ctx: Arc<PruneContext>,
    conversation: Option<String>,
    file: Option<PathBuf>,
) -> Result<()> {
    let body = read_body(file)?;
    let terminal = Arc::new(CapturingSender::default());
    let slot = SenderSlot::new(terminal.clone());
    let service = PruneService::new(ctx);

    match &conversation {
        Some(id) => {
            let outcome = service.attach(&slot, id).await;
            eprintln!("conversation {id}: {outcome}");
        }
        None => {
            if !service.install_global(&slot) {
                eprintln!("global filtering is disabled by settings");
            }
        }
    }

    slot.send("ctxprune://rewrite", RequestOptions::post(body.clone()))
        .await
        .context("failed to send request through the chain")?;
    let rewritten = terminal.take().unwrap_or_default();

    println!("{rewritten}");
    eprintln!("modified: {}", rewritten != body);
    Ok(())
}

pub async fn janitor(ctx: Arc<PruneContext>, conversation: &str) -> Result<()> {
    let service = PruneService::new(ctx);
    match service.run_now(conversation).await? {
        Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
        None => eprintln!("{conversation} is a subagent conversation; skipped"),
    }
    Ok(())
}

pub async fn pruned(ctx: Arc<PruneContext>, conversation: Option<String>) -> Result<()> {
    let ids = match conversation {
        Some(id) => ctx.store.get(&id).await?,
        None => {
            let mut ids: Vec<String> = ctx.store.global_union().await?.into_iter().collect();
            ids.sort();
            ids
        }
    };
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

pub fn print_schema() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&settings_json_schema())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxprune_core::host::{ConversationInfo, EntryPart, EntryRole, TranscriptEntry};
    use ctxprune_core::persistence::ConversationFile;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_context_reads_files_under_data_dir() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileConversationStore::new(temp_dir.path()).unwrap();
        store
            .save(&ConversationFile {
                id: "s1".to_string(),
                parent_id: None,
                updated_at: None,
                entries: vec![TranscriptEntry {
                    id: "m1".to_string(),
                    role: EntryRole::Assistant,
                    parts: vec![EntryPart::Text {
                        text: "hello".to_string(),
                    }],
                }],
            })
            .await
            .unwrap();

        let ctx = build_context(temp_dir.path(), temp_dir.path().join("settings.toml")).unwrap();

        assert!(temp_dir.path().join("settings.toml").exists());
        assert_eq!(
            ctx.directory.get("s1").await.unwrap(),
            ConversationInfo::new("s1")
        );
        assert_eq!(ctx.transcripts.fetch("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_capturing_sender_keeps_last_body() {
        let sender = CapturingSender::default();
        sender
            .send("t", RequestOptions::post("{\"a\":1}"))
            .await
            .unwrap();
        assert_eq!(sender.take().as_deref(), Some("{\"a\":1}"));
        assert_eq!(sender.take(), None);
    }
}
