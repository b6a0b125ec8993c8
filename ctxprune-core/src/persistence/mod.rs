//! File-backed collaborators for hosts that keep conversations on disk.

pub mod snapshot;
pub mod storage;

pub use snapshot::FileSnapshotSink;
pub use storage::{ConversationFile, FileConversationStore, JsonPrunedHistory};

use anyhow::{Context, Result};
use std::path::PathBuf;

/// `~/.ctxprune`, the root of every default path.
pub fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("failed to get home directory")?;
    Ok(home.join(".ctxprune"))
}
