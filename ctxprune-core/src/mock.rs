//! In-memory collaborators for tests and embedding without a host.
//!
//! Clones share the same internal state, so a test can keep one handle and
//! hand another to the context.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::PruneError;
use crate::host::{
    ConversationDirectory, ConversationInfo, PrunedHistory, RequestOptions, RequestSender,
    SenderResponse, SnapshotSink, TranscriptEntry, TranscriptSource,
};

#[derive(Default)]
struct DirectoryState {
    conversations: Vec<ConversationInfo>,
    fail_list: bool,
    failing: HashSet<String>,
    get_calls: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, info: ConversationInfo) {
        let mut state = self.state.lock().unwrap();
        state.conversations.retain(|c| c.id != info.id);
        state.conversations.push(info);
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.state.lock().unwrap().fail_list = fail;
    }

    pub fn fail_get_for(&self, id: &str) {
        self.state.lock().unwrap().failing.insert(id.to_string());
    }

    pub fn get_count(&self, id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .get_calls
            .get(id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl ConversationDirectory for InMemoryDirectory {
    async fn list(&self) -> Result<Vec<ConversationInfo>, PruneError> {
        let state = self.state.lock().unwrap();
        if state.fail_list {
            return Err(PruneError::Directory(anyhow::anyhow!(
                "Mock directory listing failure"
            )));
        }
        Ok(state.conversations.clone())
    }

    async fn get(&self, id: &str) -> Result<ConversationInfo, PruneError> {
        let mut state = self.state.lock().unwrap();
        *state.get_calls.entry(id.to_string()).or_insert(0) += 1;
        if state.failing.contains(id) {
            return Err(PruneError::Directory(anyhow::anyhow!(
                "Mock lookup failure for {id}"
            )));
        }
        state
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| PruneError::Directory(anyhow::anyhow!("Unknown conversation {id}")))
    }
}

#[derive(Default)]
struct TranscriptState {
    transcripts: HashMap<String, Vec<TranscriptEntry>>,
    failing: HashSet<String>,
    fetch_calls: HashMap<String, usize>,
    delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct InMemoryTranscripts {
    state: Arc<Mutex<TranscriptState>>,
}

impl InMemoryTranscripts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, conversation_id: &str, entries: Vec<TranscriptEntry>) {
        self.state
            .lock()
            .unwrap()
            .transcripts
            .insert(conversation_id.to_string(), entries);
    }

    pub fn fail_for(&self, conversation_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(conversation_id.to_string());
    }

    /// Every fetch sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    pub fn fetch_count(&self, conversation_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .fetch_calls
            .get(conversation_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl TranscriptSource for InMemoryTranscripts {
    async fn fetch(&self, conversation_id: &str) -> Result<Vec<TranscriptEntry>, PruneError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            *state
                .fetch_calls
                .entry(conversation_id.to_string())
                .or_insert(0) += 1;
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().unwrap();
        if state.failing.contains(conversation_id) {
            return Err(PruneError::Transcript(anyhow::anyhow!(
                "Mock transcript failure for {conversation_id}"
            )));
        }
        Ok(state
            .transcripts
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct HistoryState {
    persisted: HashMap<String, Vec<String>>,
    failing: HashSet<String>,
    load_calls: HashMap<String, usize>,
    delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct InMemoryHistory {
    state: Arc<Mutex<HistoryState>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, conversation_id: &str, ids: &[&str]) {
        self.state.lock().unwrap().persisted.insert(
            conversation_id.to_string(),
            ids.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn fail_loads_for(&self, conversation_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(conversation_id.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    pub fn load_count(&self, conversation_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .load_calls
            .get(conversation_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn persisted(&self, conversation_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .persisted
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl PrunedHistory for InMemoryHistory {
    async fn load(&self, conversation_id: &str) -> Result<Vec<String>, PruneError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            *state
                .load_calls
                .entry(conversation_id.to_string())
                .or_insert(0) += 1;
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().unwrap();
        if state.failing.contains(conversation_id) {
            return Err(PruneError::History(anyhow::anyhow!(
                "Mock history failure for {conversation_id}"
            )));
        }
        Ok(state
            .persisted
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record(&self, conversation_id: &str, call_ids: &[String]) -> Result<(), PruneError> {
        let mut state = self.state.lock().unwrap();
        let persisted = state
            .persisted
            .entry(conversation_id.to_string())
            .or_default();
        for id in call_ids {
            if !persisted.contains(id) {
                persisted.push(id.clone());
            }
        }
        Ok(())
    }
}

/// Mock behavior for the recording sender
#[derive(Debug, Clone, Default)]
pub enum SenderBehavior {
    /// Echo the received body back with status 200
    #[default]
    Echo,
    /// Always fail with a transport error
    AlwaysError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedRequest {
    pub target: String,
    pub options: RequestOptions,
}

/// Terminal sender that records every request it receives.
#[derive(Clone, Default)]
pub struct RecordingSender {
    behavior: Arc<Mutex<SenderBehavior>>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl RecordingSender {
    pub fn new(behavior: SenderBehavior) -> Self {
        Self {
            behavior: Arc::new(Mutex::new(behavior)),
            captured: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_behavior(&self, behavior: SenderBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn get_call_count(&self) -> usize {
        self.captured.lock().unwrap().len()
    }

    pub fn get_captured_requests(&self) -> Vec<CapturedRequest> {
        self.captured.lock().unwrap().clone()
    }

    pub fn get_last_body(&self) -> Option<String> {
        self.captured
            .lock()
            .unwrap()
            .last()
            .and_then(|r| r.options.body.clone())
    }

    pub fn get_last_json(&self) -> Option<Value> {
        serde_json::from_str(&self.get_last_body()?).ok()
    }
}

#[async_trait::async_trait]
impl RequestSender for RecordingSender {
    async fn send(
        &self,
        target: &str,
        options: RequestOptions,
    ) -> Result<SenderResponse, PruneError> {
        self.captured.lock().unwrap().push(CapturedRequest {
            target: target.to_string(),
            options: options.clone(),
        });

        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            SenderBehavior::Echo => Ok(SenderResponse {
                status: 200,
                body: options.body.unwrap_or_default(),
            }),
            SenderBehavior::AlwaysError => Err(PruneError::Transport(anyhow::anyhow!(
                "Mock transport failure"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedSnapshot {
    pub label: String,
    pub body: Option<Value>,
    pub transcript_len: Option<usize>,
}

#[derive(Clone, Default)]
pub struct InMemorySnapshots {
    captured: Arc<Mutex<Vec<CapturedSnapshot>>>,
}

impl InMemorySnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.captured
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.label.clone())
            .collect()
    }

    /// Most recent snapshot taken under `label`.
    pub fn last(&self, label: &str) -> Option<CapturedSnapshot> {
        self.captured
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.label == label)
            .cloned()
    }
}

#[async_trait::async_trait]
impl SnapshotSink for InMemorySnapshots {
    async fn snapshot(
        &self,
        label: &str,
        body: Option<&Value>,
        transcript: Option<&[TranscriptEntry]>,
    ) -> Result<(), PruneError> {
        self.captured.lock().unwrap().push(CapturedSnapshot {
            label: label.to_string(),
            body: body.cloned(),
            transcript_len: transcript.map(|t| t.len()),
        });
        Ok(())
    }
}
