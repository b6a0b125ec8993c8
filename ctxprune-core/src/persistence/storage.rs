use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::PruneError;
use crate::host::{
    ConversationDirectory, ConversationInfo, PrunedHistory, TranscriptEntry, TranscriptSource,
};

/// On-disk form of one conversation: `<root>/conversations/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationFile {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: Vec<TranscriptEntry>,
}

impl ConversationFile {
    pub fn info(&self) -> ConversationInfo {
        ConversationInfo {
            id: self.id.clone(),
            parent_id: self.parent_id.clone(),
        }
    }
}

fn json_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.json"))
}

/// Serves both the directory and the transcripts from one folder of
/// conversation files.
#[derive(Debug, Clone)]
pub struct FileConversationStore {
    dir: PathBuf,
}

impl FileConversationStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("conversations");
        std::fs::create_dir_all(&dir).context("failed to create conversations directory")?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn save(&self, conversation: &ConversationFile) -> Result<()> {
        let mut to_save = conversation.clone();
        to_save.updated_at = Some(Utc::now());
        let json =
            serde_json::to_string_pretty(&to_save).context("failed to serialize conversation")?;
        fs::write(json_path(&self.dir, &conversation.id), json)
            .await
            .context("failed to write conversation file")?;
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<ConversationFile> {
        let path = json_path(&self.dir, id);
        let json = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read conversation file {path:?}"))?;
        serde_json::from_str(&json).context("failed to deserialize conversation")
    }

    /// Every parseable conversation file, oldest first. Unreadable files are
    /// skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<ConversationFile>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .context("failed to read conversations directory")?;
        let mut conversations = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .context("failed to read directory entry")?
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let json = match fs::read_to_string(&path).await {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(?path, %e, "Skipping unreadable conversation file");
                    continue;
                }
            };
            match serde_json::from_str::<ConversationFile>(&json) {
                Ok(conversation) => conversations.push(conversation),
                Err(e) => {
                    tracing::warn!(?path, %e, "Skipping unparseable conversation file");
                }
            }
        }

        conversations.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(conversations)
    }
}

#[async_trait::async_trait]
impl ConversationDirectory for FileConversationStore {
    async fn list(&self) -> Result<Vec<ConversationInfo>, PruneError> {
        let conversations = self.load_all().await.map_err(PruneError::Directory)?;
        Ok(conversations.iter().map(ConversationFile::info).collect())
    }

    async fn get(&self, id: &str) -> Result<ConversationInfo, PruneError> {
        let conversation = self.load(id).await.map_err(PruneError::Directory)?;
        Ok(conversation.info())
    }
}

#[async_trait::async_trait]
impl TranscriptSource for FileConversationStore {
    async fn fetch(&self, conversation_id: &str) -> Result<Vec<TranscriptEntry>, PruneError> {
        let conversation = self
            .load(conversation_id)
            .await
            .map_err(PruneError::Transcript)?;
        Ok(conversation.entries)
    }
}

/// Pruned ids per conversation as JSON arrays in `<root>/pruned/<id>.json`.
pub struct JsonPrunedHistory {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonPrunedHistory {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("pruned");
        std::fs::create_dir_all(&dir).context("failed to create pruned directory")?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    async fn read(&self, conversation_id: &str) -> Result<Vec<String>> {
        let path = json_path(&self.dir, conversation_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let json = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read pruned ids {path:?}"))?;
        serde_json::from_str(&json).context("failed to deserialize pruned ids")
    }

    async fn append(&self, conversation_id: &str, call_ids: &[String]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut ids = self.read(conversation_id).await?;
        for id in call_ids {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        let json = serde_json::to_string_pretty(&ids).context("failed to serialize pruned ids")?;
        fs::write(json_path(&self.dir, conversation_id), json)
            .await
            .context("failed to write pruned ids")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl PrunedHistory for JsonPrunedHistory {
    async fn load(&self, conversation_id: &str) -> Result<Vec<String>, PruneError> {
        self.read(conversation_id)
            .await
            .map_err(PruneError::History)
    }

    async fn record(&self, conversation_id: &str, call_ids: &[String]) -> Result<(), PruneError> {
        self.append(conversation_id, call_ids)
            .await
            .map_err(PruneError::History)
    }
}
