//! Background analysis of idle conversations.
//!
//! Idle signals are admitted at most once per conversation at a time and run
//! on a bounded worker pool. A run reads the transcript, asks the configured
//! [`StalenessPolicy`] which outputs are superseded, and marks them in the
//! shared [`PrunedIdStore`](crate::store::PrunedIdStore).

pub mod policy;
pub mod stats;

pub use policy::{
    policy_from_config, CompositePolicy, DeduplicationPolicy, FnPolicy, KeepRecentPolicy,
    ObservedCall, PolicyInput, StalenessPolicy, SupersededWritePolicy,
};
pub use stats::{SessionStats, StatsRegistry};

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::cache::ToolParamCache;
use crate::context::PruneContext;
use crate::error::PruneError;
use crate::host::{EntryPart, TranscriptEntry};
use crate::settings::JanitorConfig;

/// Flattens the tool parts of a transcript into calls, in order. Parameters
/// the transcript lacks are taken from the capture cache, trying the id as
/// given and then lower-cased.
pub fn observe_calls(
    transcript: &[TranscriptEntry],
    params: &ToolParamCache,
) -> Vec<ObservedCall> {
    let mut seen = HashSet::new();
    let mut calls = Vec::new();
    for (entry_index, entry) in transcript.iter().enumerate() {
        for part in &entry.parts {
            let EntryPart::Tool {
                call_id,
                tool,
                input,
                output,
            } = part
            else {
                continue;
            };
            if !seen.insert(call_id.as_str()) {
                continue;
            }
            let parameters = input.clone().or_else(|| {
                params
                    .get(call_id)
                    .or_else(|| params.get(&call_id.to_lowercase()))
                    .map(|record| record.parameters)
            });
            calls.push(ObservedCall {
                call_id: call_id.clone(),
                tool: tool.clone(),
                parameters,
                output: output.clone(),
                entry_index,
            });
        }
    }
    calls
}

/// Occurrence index of each call among calls to the same tool, in transcript
/// order. Requests replay history in the same order, so this is the slot an
/// id-less result of that call occupies in the position map.
fn occurrence_indices(calls: &[ObservedCall]) -> HashMap<String, usize> {
    let mut next: HashMap<&str, usize> = HashMap::new();
    calls
        .iter()
        .map(|call| {
            let slot = next.entry(call.tool.as_str()).or_insert(0);
            let index = *slot;
            *slot += 1;
            (call.call_id.clone(), index)
        })
        .collect()
}

/// Result of an idle signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Admission {
    Accepted,
    /// A run for the conversation is already executing or queued.
    AlreadyRunning,
    /// Pending capacity exhausted.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub conversation_id: String,
    pub calls_seen: usize,
    /// Ids marked by this run, in transcript order.
    pub newly_pruned: Vec<String>,
    /// Positional ids marked alongside, for results that carry no call id.
    pub positional_aliases: Vec<String>,
    pub total_pruned: usize,
}

struct JanitorInner {
    ctx: Arc<PruneContext>,
    policy: Arc<dyn StalenessPolicy>,
    in_flight: Mutex<HashSet<String>>,
    workers: Arc<Semaphore>,
    max_pending: usize,
}

/// Removes the conversation from the in-flight set however the run ends.
struct InFlightGuard {
    inner: Arc<JanitorInner>,
    conversation_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner
            .in_flight
            .lock()
            .unwrap()
            .remove(&self.conversation_id);
    }
}

pub struct Janitor {
    inner: Arc<JanitorInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Janitor {
    pub fn new(
        ctx: Arc<PruneContext>,
        policy: Arc<dyn StalenessPolicy>,
        config: &JanitorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(JanitorInner {
                ctx,
                policy,
                in_flight: Mutex::new(HashSet::new()),
                workers: Arc::new(Semaphore::new(config.max_concurrent_runs.max(1))),
                max_pending: config.max_pending.max(1),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Janitor with the policy and limits named in the context's settings.
    pub fn from_settings(ctx: Arc<PruneContext>) -> Self {
        let config = ctx.settings.settings().janitor;
        let policy = Arc::new(policy_from_config(&config));
        Self::new(ctx, policy, &config)
    }

    pub fn is_running(&self, conversation_id: &str) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap()
            .contains(conversation_id)
    }

    /// Foreground runs skip the pending limit; they never wait in the queue.
    fn admit(&self, conversation_id: &str, queued: bool) -> Result<InFlightGuard, Admission> {
        let mut in_flight = self.inner.in_flight.lock().unwrap();
        if in_flight.contains(conversation_id) {
            return Err(Admission::AlreadyRunning);
        }
        if queued && in_flight.len() >= self.inner.max_pending {
            return Err(Admission::Rejected);
        }
        in_flight.insert(conversation_id.to_string());
        Ok(InFlightGuard {
            inner: self.inner.clone(),
            conversation_id: conversation_id.to_string(),
        })
    }

    /// Schedules a run in the background. Failures of the run are logged and
    /// counted, never returned.
    pub fn submit(&self, conversation_id: &str) -> Admission {
        let guard = match self.admit(conversation_id, true) {
            Ok(guard) => guard,
            Err(admission) => {
                debug!(conversation_id, %admission, "Idle signal not admitted");
                return admission;
            }
        };

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = inner.workers.clone().acquire_owned().await else {
                return;
            };
            let conversation_id = guard.conversation_id.clone();
            if let Err(e) = analyze(&inner, &conversation_id).await {
                error!(?e, conversation_id, "Janitor run failed");
                inner.ctx.stats.record_failure(&conversation_id);
            }
            drop(guard);
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        Admission::Accepted
    }

    /// Runs one pass in the caller's task. Shares admission with `submit`, so
    /// it fails rather than overlap an existing run.
    pub async fn run(&self, conversation_id: &str) -> Result<RunReport, PruneError> {
        let guard = self
            .admit(conversation_id, false)
            .map_err(|_| PruneError::AlreadyRunning(conversation_id.to_string()))?;
        let _permit = self
            .inner
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PruneError::Policy(e.into()))?;

        let result = analyze(&self.inner, conversation_id).await;
        if result.is_err() {
            self.inner.ctx.stats.record_failure(conversation_id);
        }
        drop(guard);
        result
    }

    /// Waits for every submitted run to finish.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in futures::future::join_all(tasks).await {
            if let Err(e) = task {
                error!(?e, "Janitor task panicked");
            }
        }
    }
}

async fn analyze(inner: &JanitorInner, conversation_id: &str) -> Result<RunReport, PruneError> {
    let ctx = &inner.ctx;
    let transcript = ctx.transcripts.fetch(conversation_id).await?;

    let settings = ctx.settings.settings();
    let mut calls = observe_calls(&transcript, &ctx.tool_params);
    let occurrences = occurrence_indices(&calls);
    calls.retain(|call| !settings.is_protected(&call.tool));

    let already_pruned = ctx.store.get_set(conversation_id).await?;
    let model = ctx.models.get(conversation_id);
    let superseded = inner.policy.superseded(&PolicyInput {
        conversation_id,
        calls: &calls,
        transcript: &transcript,
        already_pruned: &already_pruned,
        model: model.as_ref(),
    })?;

    let newly_pruned: Vec<String> = calls
        .iter()
        .filter(|call| superseded.contains(&call.call_id))
        .filter(|call| !already_pruned.contains(&call.call_id))
        .filter(|call| ctx.store.mark(conversation_id, &call.call_id))
        .map(|call| call.call_id.clone())
        .collect();

    // Calls pruned by earlier runs too: their slots may have been captured since.
    let positional_aliases: Vec<String> = calls
        .iter()
        .filter(|call| {
            superseded.contains(&call.call_id) || already_pruned.contains(&call.call_id)
        })
        .filter_map(|call| {
            let index = *occurrences.get(&call.call_id)?;
            ctx.positions.resolve(conversation_id, &call.tool, index)
        })
        .filter(|alias| ctx.store.mark(conversation_id, alias))
        .collect();

    let marked: Vec<String> = newly_pruned
        .iter()
        .chain(&positional_aliases)
        .cloned()
        .collect();
    ctx.store.persist(conversation_id, &marked).await;
    ctx.stats
        .record_run(conversation_id, calls.len(), newly_pruned.len());

    info!(
        conversation_id,
        policy = inner.policy.name(),
        calls_seen = calls.len(),
        newly_pruned = newly_pruned.len(),
        positional_aliases = positional_aliases.len(),
        "Janitor run complete"
    );

    ctx.snapshot(
        &format!("janitor-{conversation_id}"),
        None,
        Some(transcript.as_slice()),
    )
    .await;

    Ok(RunReport {
        conversation_id: conversation_id.to_string(),
        calls_seen: calls.len(),
        total_pruned: already_pruned.len() + marked.len(),
        newly_pruned,
        positional_aliases,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ToolCallRecord;
    use crate::context::PruneContextBuilder;
    use crate::host::EntryRole;
    use crate::mock::{InMemoryHistory, InMemoryTranscripts};
    use crate::settings::{PruneSettings, SettingsManager, StrategyKind};
    use serde_json::json;
    use std::time::Duration;

    fn tool(call_id: &str, name: &str, input: Option<serde_json::Value>) -> EntryPart {
        EntryPart::Tool {
            call_id: call_id.to_string(),
            tool: name.to_string(),
            input,
            output: Some(format!("{name} output")),
        }
    }

    fn entry(id: &str, parts: Vec<EntryPart>) -> TranscriptEntry {
        TranscriptEntry {
            id: id.to_string(),
            role: EntryRole::Assistant,
            parts,
        }
    }

    fn context(
        transcripts: &InMemoryTranscripts,
        history: &InMemoryHistory,
    ) -> Arc<PruneContext> {
        let mut settings = PruneSettings::default();
        settings.janitor.strategies = vec![StrategyKind::Deduplication];
        PruneContextBuilder::new()
            .settings(SettingsManager::ephemeral(settings))
            .transcripts(Arc::new(transcripts.clone()))
            .history(Arc::new(history.clone()))
            .build()
    }

    #[test]
    fn test_observe_calls_falls_back_to_cache() {
        let params = ToolParamCache::new();
        params.put(ToolCallRecord {
            call_id: "call_b".to_string(),
            tool: "grep".to_string(),
            parameters: json!({"pattern": "x"}),
            order: 0,
        });
        let transcript = vec![
            entry("m1", vec![tool("c1", "read", Some(json!({"path": "a"})))]),
            entry(
                "m2",
                vec![
                    EntryPart::Text {
                        text: "thinking".to_string(),
                    },
                    tool("CALL_B", "grep", None),
                    tool("c3", "ls", None),
                    tool("c1", "read", None),
                ],
            ),
        ];

        let calls = observe_calls(&transcript, &params);

        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].parameters, Some(json!({"path": "a"})));
        assert_eq!(calls[1].parameters, Some(json!({"pattern": "x"})));
        assert_eq!(calls[1].entry_index, 1);
        assert_eq!(calls[2].parameters, None);
    }

    #[tokio::test]
    async fn test_run_marks_persists_and_skips_protected() {
        let transcripts = InMemoryTranscripts::new();
        let history = InMemoryHistory::new();
        transcripts.set(
            "s1",
            vec![entry(
                "m1",
                vec![
                    tool("c1", "grep", Some(json!({"pattern": "x"}))),
                    tool("t1", "todowrite", Some(json!({"items": []}))),
                    tool("c2", "grep", Some(json!({"pattern": "x"}))),
                    tool("t2", "TodoWrite", Some(json!({"items": []}))),
                ],
            )],
        );
        let ctx = context(&transcripts, &history);
        let janitor = Janitor::from_settings(ctx.clone());

        let report = janitor.run("s1").await.unwrap();

        assert_eq!(report.calls_seen, 2);
        assert_eq!(report.newly_pruned, vec!["c1"]);
        assert_eq!(report.total_pruned, 1);
        assert_eq!(history.persisted("s1"), vec!["c1"]);
        assert_eq!(ctx.stats.get("s1").unwrap().runs, 1);

        let again = janitor.run("s1").await.unwrap();
        assert!(again.newly_pruned.is_empty());
        assert_eq!(again.total_pruned, 1);
    }

    #[tokio::test]
    async fn test_failed_run_leaves_marks_untouched() {
        let transcripts = InMemoryTranscripts::new();
        let history = InMemoryHistory::new();
        transcripts.fail_for("s1");
        let ctx = context(&transcripts, &history);
        ctx.store.mark("s1", "kept");
        let janitor = Janitor::from_settings(ctx.clone());

        assert_eq!(janitor.submit("s1"), Admission::Accepted);
        janitor.shutdown().await;

        assert_eq!(ctx.store.get("s1").await.unwrap(), vec!["kept"]);
        assert_eq!(ctx.stats.get("s1").unwrap().failed_runs, 1);
        assert!(!janitor.is_running("s1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_simultaneous_idle_signals_run_once() {
        let transcripts = InMemoryTranscripts::new();
        let history = InMemoryHistory::new();
        transcripts.set_delay(Duration::from_millis(100));
        let ctx = context(&transcripts, &history);
        let janitor = Arc::new(Janitor::from_settings(ctx));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let janitor = janitor.clone();
            handles.push(tokio::spawn(async move { janitor.submit("s1") }));
        }
        let mut admissions = Vec::new();
        for handle in handles {
            admissions.push(handle.await.unwrap());
        }
        janitor.shutdown().await;

        let accepted = admissions
            .iter()
            .filter(|a| **a == Admission::Accepted)
            .count();
        assert_eq!(accepted, 1);
        assert!(admissions
            .iter()
            .all(|a| matches!(a, Admission::Accepted | Admission::AlreadyRunning)));
        assert_eq!(transcripts.fetch_count("s1"), 1);

        assert_eq!(janitor.submit("s1"), Admission::Accepted);
        janitor.shutdown().await;
        assert_eq!(transcripts.fetch_count("s1"), 2);
    }

    #[tokio::test]
    async fn test_pending_capacity_rejects_overflow() {
        let transcripts = InMemoryTranscripts::new();
        let history = InMemoryHistory::new();
        transcripts.set_delay(Duration::from_millis(50));
        let ctx = context(&transcripts, &history);
        let config = JanitorConfig {
            max_concurrent_runs: 1,
            max_pending: 2,
            ..Default::default()
        };
        let janitor = Janitor::new(ctx, Arc::new(DeduplicationPolicy), &config);

        assert_eq!(janitor.submit("s1"), Admission::Accepted);
        assert_eq!(janitor.submit("s2"), Admission::Accepted);
        assert_eq!(janitor.submit("s3"), Admission::Rejected);
        assert!(matches!(
            janitor.run("s1").await,
            Err(PruneError::AlreadyRunning(id)) if id == "s1"
        ));

        janitor.shutdown().await;
        assert_eq!(janitor.submit("s3"), Admission::Accepted);
        janitor.shutdown().await;
    }
}
