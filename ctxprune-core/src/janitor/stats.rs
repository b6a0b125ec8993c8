use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Observability counters for one conversation. Nothing on the request path
/// reads these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub runs: u64,
    pub failed_runs: u64,
    pub last_calls_seen: usize,
    pub last_pruned: usize,
    pub total_pruned: usize,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Default)]
pub struct StatsRegistry {
    inner: Arc<Mutex<HashMap<String, SessionStats>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run(&self, conversation_id: &str, calls_seen: usize, pruned: usize) {
        let mut inner = self.inner.lock().unwrap();
        let stats = inner.entry(conversation_id.to_string()).or_default();
        stats.runs += 1;
        stats.last_calls_seen = calls_seen;
        stats.last_pruned = pruned;
        stats.total_pruned += pruned;
        stats.last_run_at = Some(Utc::now());
    }

    pub fn record_failure(&self, conversation_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let stats = inner.entry(conversation_id.to_string()).or_default();
        stats.failed_runs += 1;
        stats.last_run_at = Some(Utc::now());
    }

    pub fn get(&self, conversation_id: &str) -> Option<SessionStats> {
        self.inner.lock().unwrap().get(conversation_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runs_accumulate() {
        let stats = StatsRegistry::new();
        stats.record_run("s1", 10, 3);
        stats.record_run("s1", 12, 1);
        stats.record_failure("s1");

        let s1 = stats.get("s1").unwrap();
        assert_eq!(s1.runs, 2);
        assert_eq!(s1.failed_runs, 1);
        assert_eq!(s1.last_calls_seen, 12);
        assert_eq!(s1.last_pruned, 1);
        assert_eq!(s1.total_pruned, 4);
        assert!(stats.get("s2").is_none());
    }
}
