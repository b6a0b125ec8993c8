//! Per-conversation record of call ids whose outputs have been pruned.
//!
//! Marks are monotonic for the lifetime of the process. Each conversation is
//! seeded from [`PrunedHistory`] the first time it is read; marks written
//! before that first read are kept and merged behind the persisted ids.

use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::PruneError;
use crate::host::{ConversationDirectory, PrunedHistory};

#[derive(Default)]
struct PrunedIds {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl PrunedIds {
    fn insert(&mut self, call_id: &str) -> bool {
        if !self.seen.insert(call_id.to_string()) {
            return false;
        }
        self.order.push(call_id.to_string());
        true
    }

    fn merge_persisted(&mut self, persisted: Vec<String>) {
        let marked_early = std::mem::take(&mut self.order);
        self.seen.clear();
        for id in persisted.into_iter().chain(marked_early) {
            self.insert(&id);
        }
    }
}

#[derive(Default)]
struct Slot {
    loaded: OnceCell<()>,
    ids: Mutex<PrunedIds>,
}

pub struct PrunedIdStore {
    history: Arc<dyn PrunedHistory>,
    directory: Arc<dyn ConversationDirectory>,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl PrunedIdStore {
    pub fn new(
        history: Arc<dyn PrunedHistory>,
        directory: Arc<dyn ConversationDirectory>,
    ) -> Self {
        Self {
            history,
            directory,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, conversation_id: &str) -> Arc<Slot> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    /// Pruned ids for a conversation, in marking order. Concurrent first
    /// reads share a single history load; a failed load is retried on the
    /// next read.
    pub async fn get(&self, conversation_id: &str) -> Result<Vec<String>, PruneError> {
        let slot = self.slot(conversation_id);
        slot.loaded
            .get_or_try_init(|| async {
                let persisted = self.history.load(conversation_id).await?;
                debug!(
                    conversation_id,
                    persisted = persisted.len(),
                    "Seeded pruned ids from history"
                );
                slot.ids.lock().unwrap_or_else(PoisonError::into_inner).merge_persisted(persisted);
                Ok::<(), PruneError>(())
            })
            .await?;

        let ids = slot.ids.lock().unwrap_or_else(PoisonError::into_inner).order.clone();
        Ok(ids)
    }

    pub async fn get_set(&self, conversation_id: &str) -> Result<HashSet<String>, PruneError> {
        Ok(self.get(conversation_id).await?.into_iter().collect())
    }

    /// Returns true when the id was not already marked.
    pub fn mark(&self, conversation_id: &str, call_id: &str) -> bool {
        let slot = self.slot(conversation_id);
        let inserted = slot.ids.lock().unwrap_or_else(PoisonError::into_inner).insert(call_id);
        inserted
    }

    /// Best-effort write-through of freshly marked ids.
    pub async fn persist(&self, conversation_id: &str, call_ids: &[String]) {
        if call_ids.is_empty() {
            return;
        }
        if let Err(e) = self.history.record(conversation_id, call_ids).await {
            warn!(?e, conversation_id, "Failed to persist pruned ids");
        }
    }

    /// Union of pruned ids across every known non-subagent conversation.
    ///
    /// Listing failures are returned; a failure to load one conversation only
    /// drops that conversation's contribution.
    pub async fn global_union(&self) -> Result<HashSet<String>, PruneError> {
        let conversations = self.directory.list().await?;
        let eligible: Vec<_> = conversations
            .into_iter()
            .filter(|c| !c.is_subagent())
            .collect();

        let loads = eligible.iter().map(|c| async move { (c, self.get(&c.id).await) });

        let mut union = HashSet::new();
        for (conversation, result) in join_all(loads).await {
            match result {
                Ok(ids) => union.extend(ids),
                Err(e) => {
                    warn!(
                        ?e,
                        conversation_id = %conversation.id,
                        "Excluding conversation from global pruned set"
                    );
                }
            }
        }
        Ok(union)
    }
}
