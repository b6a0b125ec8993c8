pub mod config;
pub mod manager;


pub use config::{DebugConfig, JanitorConfig, PruneSettings, StrategyKind};
pub use manager::SettingsManager;

/// JSON schema of the settings file, for editors and the CLI.
pub fn settings_json_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(PruneSettings)
}
