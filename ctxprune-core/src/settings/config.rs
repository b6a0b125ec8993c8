use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Built-in staleness heuristics the janitor can combine.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    strum::Display,
    strum::EnumString,
    strum::VariantArray,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StrategyKind {
    /// Earlier calls with identical tool and parameters are superseded
    Deduplication,
    /// Reads of a path are superseded by a later write to the same path
    SupersededWrites,
    /// Only the newest `keep_recent` outputs of each tool survive
    KeepRecent,
}

fn default_enabled() -> bool {
    true
}

fn default_global_fast_path() -> bool {
    true
}

fn default_protected_tools() -> HashSet<String> {
    ["task", "todowrite", "todoread"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_strategies() -> Vec<StrategyKind> {
    vec![StrategyKind::Deduplication, StrategyKind::SupersededWrites]
}

fn default_max_concurrent_runs() -> usize {
    2
}

fn default_max_pending() -> usize {
    32
}

/// Janitor scheduling and policy selection.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[schemars(title = "Janitor")]
pub struct JanitorConfig {
    /// Heuristics combined into the staleness policy. Empty disables marking.
    #[serde(default = "default_strategies")]
    #[schemars(default = "default_strategies")]
    pub strategies: Vec<StrategyKind>,
    /// Outputs retained per tool by the keep_recent strategy. 0 keeps all.
    #[serde(default)]
    pub keep_recent: usize,
    /// Upper bound on janitor runs executing at the same time.
    #[serde(default = "default_max_concurrent_runs")]
    #[schemars(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Accepted runs (executing or waiting for a worker) before new idle
    /// signals are rejected.
    #[serde(default = "default_max_pending")]
    #[schemars(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            strategies: default_strategies(),
            keep_recent: 0,
            max_concurrent_runs: default_max_concurrent_runs(),
            max_pending: default_max_pending(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[schemars(title = "Debug")]
pub struct DebugConfig {
    /// Write a labeled snapshot of every rewritten request and janitor run.
    #[serde(default)]
    pub snapshots: bool,
    /// Where snapshots go. Defaults to ~/.ctxprune/snapshots.
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
}

/// Core pruning settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[schemars(title = "ctxprune")]
pub struct PruneSettings {
    /// Master switch. When off, no senders are wrapped and idle signals are
    /// ignored.
    #[serde(default = "default_enabled")]
    #[schemars(default = "default_enabled")]
    pub enabled: bool,

    /// Filter requests whose conversation is unknown against the union of
    /// every conversation's pruned ids.
    #[serde(default = "default_global_fast_path")]
    #[schemars(default = "default_global_fast_path")]
    pub global_fast_path: bool,

    /// Tools whose outputs are never pruned (compared case-insensitively).
    #[serde(default = "default_protected_tools")]
    #[schemars(default = "default_protected_tools")]
    pub protected_tools: HashSet<String>,

    #[serde(default)]
    pub janitor: JanitorConfig,

    #[serde(default)]
    pub debug: DebugConfig,
}

impl Default for PruneSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            global_fast_path: default_global_fast_path(),
            protected_tools: default_protected_tools(),
            janitor: JanitorConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl PruneSettings {
    pub fn is_protected(&self, tool: &str) -> bool {
        let tool = tool.to_lowercase();
        self.protected_tools
            .iter()
            .any(|p| p.to_lowercase() == tool)
    }

    pub fn snapshot_dir(&self) -> Option<PathBuf> {
        self.debug.snapshot_dir.clone().or_else(|| {
            dirs::home_dir().map(|home| home.join(".ctxprune").join("snapshots"))
        })
    }
}
