use anyhow::anyhow;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PruneError {
    #[error("Conversation directory error: {0}")]
    Directory(anyhow::Error),

    #[error("Transcript error: {0}")]
    Transcript(anyhow::Error),

    #[error("Pruned history error: {0}")]
    History(anyhow::Error),

    #[error("Staleness policy error: {0}")]
    Policy(anyhow::Error),

    /// Raised by the underlying request sender. Passed back to the caller
    /// untouched; never produced by the rewriting layer itself.
    #[error("Transport error: {0}")]
    Transport(anyhow::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(anyhow::Error),

    #[error("A janitor run for conversation {0} is already in progress")]
    AlreadyRunning(String),

    #[error("JSON error: {0}")]
    Json(anyhow::Error),
}

impl From<serde_json::Error> for PruneError {
    fn from(source: serde_json::Error) -> Self {
        Self::Json(anyhow!(source))
    }
}
