pub mod cache;
pub mod chain;
pub mod context;
pub mod error;
pub mod host;
pub mod janitor;
pub mod mock;
pub mod persistence;
pub mod request;
pub mod service;
pub mod settings;
pub mod store;

// Public library API - hosts embedding ctxprune should only need these; the
// modules stay public for anyone wiring custom stages or policies.
pub use chain::{PruningSender, Scope, SenderSlot};
pub use context::{PruneContext, PruneContextBuilder};
pub use error::PruneError;
pub use host::{
    ConversationDirectory, PrunedHistory, RequestSender, SnapshotSink, TranscriptSource,
};
pub use janitor::{Admission, Janitor, RunReport, StalenessPolicy};
pub use request::{Pipeline, CHAT_PLACEHOLDER, STRUCTURED_PLACEHOLDER};
pub use service::{AttachOutcome, IdleOutcome, PruneService};
pub use settings::{PruneSettings, SettingsManager};
pub use store::PrunedIdStore;
