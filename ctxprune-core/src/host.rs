//! Interfaces to the collaborators that live outside the pruning core.
//!
//! The host (an editor plugin, a proxy, the CLI) provides the conversation
//! directory, transcripts, pruned-id history, the request transport and an
//! optional snapshot sink. File-backed implementations live in
//! [`crate::persistence`], in-memory ones in [`crate::mock`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PruneError;

/// A conversation as reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl ConversationInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
        }
    }

    pub fn child_of(id: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: Some(parent.into()),
        }
    }

    /// Subagent conversations are excluded from all pruning logic. An empty
    /// parent id counts as no parent.
    pub fn is_subagent(&self) -> bool {
        self.parent_id.as_deref().is_some_and(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPart {
    Text {
        text: String,
    },
    Tool {
        call_id: String,
        tool: String,
        /// Absent when the host does not retain call arguments; the janitor
        /// falls back to the parameters captured from outgoing requests.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
}

/// One message of a conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub role: EntryRole,
    #[serde(default)]
    pub parts: Vec<EntryPart>,
}

impl TranscriptEntry {
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                EntryPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Options passed alongside the target of an outgoing request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
}

impl RequestOptions {
    pub fn post(body: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Some(body.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderResponse {
    pub status: u16,
    pub body: String,
}

#[async_trait::async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn list(&self) -> Result<Vec<ConversationInfo>, PruneError>;

    async fn get(&self, id: &str) -> Result<ConversationInfo, PruneError>;
}

#[async_trait::async_trait]
pub trait TranscriptSource: Send + Sync {
    async fn fetch(&self, conversation_id: &str) -> Result<Vec<TranscriptEntry>, PruneError>;
}

/// Persisted pruning decisions, used to seed the in-memory store lazily.
#[async_trait::async_trait]
pub trait PrunedHistory: Send + Sync {
    async fn load(&self, conversation_id: &str) -> Result<Vec<String>, PruneError>;

    async fn record(&self, conversation_id: &str, call_ids: &[String]) -> Result<(), PruneError>;
}

/// The request-sending capability being intercepted.
#[async_trait::async_trait]
pub trait RequestSender: Send + Sync {
    async fn send(
        &self,
        target: &str,
        options: RequestOptions,
    ) -> Result<SenderResponse, PruneError>;
}

#[async_trait::async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn snapshot(
        &self,
        label: &str,
        body: Option<&Value>,
        transcript: Option<&[TranscriptEntry]>,
    ) -> Result<(), PruneError>;
}
