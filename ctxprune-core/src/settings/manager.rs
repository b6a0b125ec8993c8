use crate::settings::config::PruneSettings;
use anyhow::{Context, Result};
use std::fs;
use std::ops::DerefMut;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Settings shared by every component of one pruning context. Updates made
/// through the manager are visible to all clones immediately; they reach disk
/// only on an explicit save.
#[derive(Clone)]
pub struct SettingsManager {
    settings_path: Option<PathBuf>,
    inner: Arc<Mutex<PruneSettings>>,
}

impl SettingsManager {
    /// Create a new settings manager with default settings location
    pub fn new() -> Result<Self> {
        let settings_path = Self::default_settings_path()?;
        Self::from_path(settings_path)
    }

    /// Settings that live only in memory; `save` is rejected.
    pub fn ephemeral(settings: PruneSettings) -> Self {
        Self {
            settings_path: None,
            inner: Arc::new(Mutex::new(settings)),
        }
    }

    /// Create a settings manager from a specific path
    pub fn from_path(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {parent:?}"))?;
            }
            let contents = toml::to_string_pretty(&PruneSettings::default())
                .context("Failed to serialize default settings")?;
            fs::write(&path, contents)
                .with_context(|| format!("Failed to write default settings to {path:?}"))?;
        }

        let loaded = Self::load_from_file_with_backup(&path)?;

        Ok(Self {
            settings_path: Some(path),
            inner: Arc::new(Mutex::new(loaded)),
        })
    }

    /// Get the default settings path (~/.ctxprune/settings.toml)
    pub fn default_settings_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".ctxprune").join("settings.toml"))
    }

    /// Load settings from a TOML file with backup on parse failure
    fn load_from_file_with_backup(path: &Path) -> Result<PruneSettings> {
        if !path.exists() {
            return Ok(PruneSettings::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {path:?}"))?;

        match toml::from_str(&contents) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                tracing::warn!(?path, %e, "Settings file is corrupt, restoring defaults");
                let backup_path = path.with_extension("toml.backup");
                fs::rename(path, &backup_path).with_context(|| {
                    format!("Failed to backup corrupted settings to {backup_path:?}")
                })?;

                let default_settings = PruneSettings::default();
                let contents = toml::to_string_pretty(&default_settings)
                    .context("Failed to serialize default settings")?;
                fs::write(path, contents)
                    .with_context(|| format!("Failed to write default settings to {path:?}"))?;

                Ok(default_settings)
            }
        }
    }

    /// Get the in-memory settings
    pub fn settings(&self) -> PruneSettings {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Update in-memory settings with a closure. Note: settings are not saved to disk
    pub fn update_setting<F>(&self, updater: F)
    where
        F: FnOnce(&mut PruneSettings),
    {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        updater(guard.deref_mut());
    }

    /// Save provided settings
    pub fn save_settings(&self, settings: PruneSettings) -> Result<()> {
        let path = self
            .settings_path
            .as_ref()
            .context("Ephemeral settings cannot be saved")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {parent:?}"))?;
        }

        let contents = toml::to_string_pretty(&settings).context("Failed to serialize settings")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write settings to {path:?}"))?;
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = settings;

        Ok(())
    }

    /// Explicitly persist in-memory settings to disk
    pub fn save(&self) -> Result<()> {
        self.save_settings(self.settings())
    }

    pub fn path(&self) -> Option<&Path> {
        self.settings_path.as_deref()
    }
}
