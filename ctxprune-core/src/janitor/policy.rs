//! Staleness policies decide which tool outputs a conversation no longer
//! needs. The janitor owns the mechanics (fetching, marking, persisting); a
//! policy only looks at the observed calls and names the superseded ones.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::cache::ModelInfo;
use crate::error::PruneError;
use crate::host::TranscriptEntry;
use crate::settings::{JanitorConfig, StrategyKind};

/// A tool call as seen in the transcript, with parameters filled in from the
/// capture cache when the transcript did not carry them.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedCall {
    pub call_id: String,
    pub tool: String,
    pub parameters: Option<Value>,
    pub output: Option<String>,
    /// Index of the transcript entry holding the call.
    pub entry_index: usize,
}

impl ObservedCall {
    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// First of `path`, `file_path` or `filePath` in the parameters.
    pub fn target_path(&self) -> Option<&str> {
        let parameters = self.parameters.as_ref()?;
        ["path", "file_path", "filePath"]
            .iter()
            .find_map(|key| parameters.get(*key).and_then(Value::as_str))
    }
}

pub struct PolicyInput<'a> {
    pub conversation_id: &'a str,
    /// In transcript order, protected tools already removed.
    pub calls: &'a [ObservedCall],
    pub transcript: &'a [TranscriptEntry],
    pub already_pruned: &'a HashSet<String>,
    pub model: Option<&'a ModelInfo>,
}

pub trait StalenessPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn superseded(&self, input: &PolicyInput<'_>) -> Result<HashSet<String>, PruneError>;
}

/// Serializes with object keys sorted so parameter equality ignores key
/// order.
fn canonical(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let ordered: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, sorted(v))).collect();
                Value::Object(ordered.into_iter().map(|(k, v)| (k.clone(), v)).collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

/// Repeated calls to the same tool with identical parameters: only the
/// latest output is kept.
pub struct DeduplicationPolicy;

impl StalenessPolicy for DeduplicationPolicy {
    fn name(&self) -> &str {
        "deduplication"
    }

    fn superseded(&self, input: &PolicyInput<'_>) -> Result<HashSet<String>, PruneError> {
        let mut latest: HashMap<(String, String), &str> = HashMap::new();
        let mut superseded = HashSet::new();
        for call in input.calls {
            let Some(parameters) = &call.parameters else {
                continue;
            };
            let key = (call.tool.to_lowercase(), canonical(parameters));
            if let Some(previous) = latest.insert(key, &call.call_id) {
                superseded.insert(previous.to_string());
            }
        }
        Ok(superseded)
    }
}

/// A read of a path becomes stale once the same path is written later on.
pub struct SupersededWritePolicy {
    read_tools: HashSet<String>,
    write_tools: HashSet<String>,
}

impl Default for SupersededWritePolicy {
    fn default() -> Self {
        Self::new(&["read", "read_file", "view"], &["write", "edit", "multiedit", "write_file"])
    }
}

impl SupersededWritePolicy {
    pub fn new(read_tools: &[&str], write_tools: &[&str]) -> Self {
        Self {
            read_tools: read_tools.iter().map(|t| t.to_lowercase()).collect(),
            write_tools: write_tools.iter().map(|t| t.to_lowercase()).collect(),
        }
    }
}

impl StalenessPolicy for SupersededWritePolicy {
    fn name(&self) -> &str {
        "superseded_writes"
    }

    fn superseded(&self, input: &PolicyInput<'_>) -> Result<HashSet<String>, PruneError> {
        let mut open_reads: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut superseded = HashSet::new();
        for call in input.calls {
            let Some(path) = call.target_path() else {
                continue;
            };
            let tool = call.tool.to_lowercase();
            if self.read_tools.contains(&tool) {
                open_reads.entry(path).or_default().push(&call.call_id);
            } else if self.write_tools.contains(&tool) {
                if let Some(reads) = open_reads.remove(path) {
                    superseded.extend(reads.into_iter().map(str::to_string));
                }
            }
        }
        Ok(superseded)
    }
}

/// Keeps the newest `keep` completed outputs of every tool.
pub struct KeepRecentPolicy {
    pub keep: usize,
}

impl StalenessPolicy for KeepRecentPolicy {
    fn name(&self) -> &str {
        "keep_recent"
    }

    fn superseded(&self, input: &PolicyInput<'_>) -> Result<HashSet<String>, PruneError> {
        if self.keep == 0 {
            return Ok(HashSet::new());
        }
        let mut per_tool: HashMap<String, Vec<&str>> = HashMap::new();
        for call in input.calls.iter().filter(|c| c.has_output()) {
            per_tool
                .entry(call.tool.to_lowercase())
                .or_default()
                .push(&call.call_id);
        }
        Ok(per_tool
            .into_values()
            .flat_map(|ids| {
                let stale = ids.len().saturating_sub(self.keep);
                ids.into_iter().take(stale).map(str::to_string)
            })
            .collect())
    }
}

/// Union of its members. The first member error aborts evaluation.
pub struct CompositePolicy {
    members: Vec<Arc<dyn StalenessPolicy>>,
}

impl CompositePolicy {
    pub fn new(members: Vec<Arc<dyn StalenessPolicy>>) -> Self {
        Self { members }
    }

    pub fn member_names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name()).collect()
    }
}

impl StalenessPolicy for CompositePolicy {
    fn name(&self) -> &str {
        "composite"
    }

    fn superseded(&self, input: &PolicyInput<'_>) -> Result<HashSet<String>, PruneError> {
        let mut union = HashSet::new();
        for member in &self.members {
            let ids = member.superseded(input)?;
            tracing::debug!(
                policy = member.name(),
                conversation_id = input.conversation_id,
                superseded = ids.len(),
                "Policy evaluated"
            );
            union.extend(ids);
        }
        Ok(union)
    }
}

/// Adapts a closure into a policy.
pub struct FnPolicy<F> {
    name: String,
    f: F,
}

impl<F> FnPolicy<F>
where
    F: Fn(&PolicyInput<'_>) -> Result<HashSet<String>, PruneError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> StalenessPolicy for FnPolicy<F>
where
    F: Fn(&PolicyInput<'_>) -> Result<HashSet<String>, PruneError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn superseded(&self, input: &PolicyInput<'_>) -> Result<HashSet<String>, PruneError> {
        (self.f)(input)
    }
}

/// Composite of the configured strategies, in order, repeats dropped.
pub fn policy_from_config(config: &JanitorConfig) -> CompositePolicy {
    let mut seen = HashSet::new();
    let members = config
        .strategies
        .iter()
        .filter(|kind| seen.insert(**kind))
        .map(|kind| -> Arc<dyn StalenessPolicy> {
            match kind {
                StrategyKind::Deduplication => Arc::new(DeduplicationPolicy),
                StrategyKind::SupersededWrites => Arc::new(SupersededWritePolicy::default()),
                StrategyKind::KeepRecent => Arc::new(KeepRecentPolicy {
                    keep: config.keep_recent,
                }),
            }
        })
        .collect();
    CompositePolicy::new(members)
}
