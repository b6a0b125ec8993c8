use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::PruneError;
use crate::host::{SnapshotSink, TranscriptEntry};

#[derive(Serialize)]
struct SnapshotRecord<'a> {
    label: &'a str,
    captured_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transcript: Option<&'a [TranscriptEntry]>,
}

/// Writes each snapshot as `<timestamp>-<label>.json`.
#[derive(Debug, Clone)]
pub struct FileSnapshotSink {
    dir: PathBuf,
}

impl FileSnapshotSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn file_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl SnapshotSink for FileSnapshotSink {
    async fn snapshot(
        &self,
        label: &str,
        body: Option<&Value>,
        transcript: Option<&[TranscriptEntry]>,
    ) -> Result<(), PruneError> {
        let now = Utc::now();
        let record = SnapshotRecord {
            label,
            captured_at: now.to_rfc3339(),
            body,
            transcript,
        };
        let json = serde_json::to_string_pretty(&record)?;
        let path = self.dir.join(format!(
            "{}-{}.json",
            now.format("%Y%m%dT%H%M%S%.6f"),
            file_label(label)
        ));

        let write = async {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .context("failed to create snapshot directory")?;
            tokio::fs::write(&path, json)
                .await
                .with_context(|| format!("failed to write snapshot {path:?}"))
        };
        write.await.map_err(PruneError::Snapshot)
    }
}
