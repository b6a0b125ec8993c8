//! Interception of the request-sending capability.
//!
//! A [`SenderSlot`] holds whatever sender is currently installed. Wrapping
//! replaces the installed instance with a [`PruningSender`] that delegates to
//! the previous one, so wraps compose in installation order.

use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, error};

use crate::context::PruneContext;
use crate::error::PruneError;
use crate::host::{RequestOptions, RequestSender, SenderResponse};
use crate::request::detect_format;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Conversation unknown; filter against every conversation's pruned ids.
    Global,
    Conversation(String),
}

impl Scope {
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Scope::Global => None,
            Scope::Conversation(id) => Some(id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Conversation(id) => write!(f, "conversation:{id}"),
        }
    }
}

pub struct PruningSender {
    inner: Arc<dyn RequestSender>,
    scope: Scope,
    ctx: Arc<PruneContext>,
}

impl PruningSender {
    pub fn new(inner: Arc<dyn RequestSender>, scope: Scope, ctx: Arc<PruneContext>) -> Self {
        Self { inner, scope, ctx }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Installs a pruning wrap for `scope` on `slot`. False when that scope
    /// is already installed there.
    pub fn install(slot: &SenderSlot, scope: Scope, ctx: Arc<PruneContext>) -> bool {
        let wrap_scope = scope.clone();
        slot.wrap(scope, move |inner| {
            Arc::new(PruningSender::new(inner, wrap_scope, ctx))
        })
    }

    async fn pruned_ids(&self) -> HashSet<String> {
        let result = match &self.scope {
            Scope::Global => {
                if !self.ctx.settings.settings().global_fast_path {
                    return HashSet::new();
                }
                self.ctx.store.global_union().await
            }
            Scope::Conversation(id) => self.ctx.store.get_set(id).await,
        };
        result.unwrap_or_else(|e| {
            error!(?e, scope = %self.scope, "Failed to resolve pruned ids, filtering nothing");
            HashSet::new()
        })
    }

    /// Best-effort rewrite of `body`. `None` leaves the request untouched.
    async fn rewrite(&self, body: &str) -> Option<String> {
        if !self.ctx.settings.settings().enabled {
            return None;
        }
        let document: Value = serde_json::from_str(body).ok()?;
        // Skip the union and every cache for bodies no stage would touch.
        detect_format(&document)?;

        let pruned = self.pruned_ids().await;
        let outcome =
            self.ctx
                .pipeline
                .rewrite_document(&document, self.scope.conversation_id(), &pruned);

        self.ctx
            .snapshot(&format!("request-{}", self.scope), Some(&outcome.document), None)
            .await;

        if !outcome.modified {
            return None;
        }
        debug!(
            scope = %self.scope,
            format = ?outcome.format,
            replaced = outcome.replaced,
            "Pruned tool outputs from request"
        );
        match serde_json::to_string(&outcome.document) {
            Ok(text) => Some(text),
            Err(e) => {
                error!(?e, "Failed to serialize rewritten request, sending original");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl RequestSender for PruningSender {
    async fn send(
        &self,
        target: &str,
        mut options: RequestOptions,
    ) -> Result<SenderResponse, PruneError> {
        if let Some(body) = options.body.as_deref() {
            if let Some(rewritten) = self.rewrite(body).await {
                options.body = Some(rewritten);
            }
        }
        self.inner.send(target, options).await
    }
}

/// Holder of the installed request sender.
pub struct SenderSlot {
    current: RwLock<Arc<dyn RequestSender>>,
    installed: Mutex<HashSet<Scope>>,
}

impl SenderSlot {
    pub fn new(sender: Arc<dyn RequestSender>) -> Self {
        Self {
            current: RwLock::new(sender),
            installed: Mutex::new(HashSet::new()),
        }
    }

    pub fn current(&self) -> Arc<dyn RequestSender> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replaces the installed sender with `make(previous)`. Refused, and
    /// `make` not called, when `scope` is already installed on this slot.
    pub fn wrap<F>(&self, scope: Scope, make: F) -> bool
    where
        F: FnOnce(Arc<dyn RequestSender>) -> Arc<dyn RequestSender>,
    {
        let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        if installed.contains(&scope) {
            debug!(%scope, "Sender already wrapped for scope");
            return false;
        }
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let previous = current.clone();
        *current = make(previous);
        installed.insert(scope);
        true
    }

    /// A new slot starting from this slot's installed sender and scopes, for
    /// a conversation-level capability derived from the process-level one.
    pub fn derive(&self) -> SenderSlot {
        let installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner).clone();
        SenderSlot {
            current: RwLock::new(self.current()),
            installed: Mutex::new(installed),
        }
    }

    pub fn installed_scopes(&self) -> Vec<Scope> {
        self.installed.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect()
    }

    pub fn is_installed(&self, scope: &Scope) -> bool {
        self.installed.lock().unwrap_or_else(PoisonError::into_inner).contains(scope)
    }

    pub async fn send(
        &self,
        target: &str,
        options: RequestOptions,
    ) -> Result<SenderResponse, PruneError> {
        self.current().send(target, options).await
    }
}
