//! Process-wide configuration store
//!
//! Holds the defaults loaded at start and merges them with the override of
//! the run bound to the current task.

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::application::run_scope::RunScope;
use crate::domain::config::{ClassifierConfig, ConfigOverride};
use crate::CoreError;

/// Owner of the process-wide classifier defaults
#[derive(Debug, Default)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    defaults: RwLock<ClassifierConfig>,
}

impl ConfigStore {
    /// Store with fixed defaults and no backing file
    pub fn new(defaults: ClassifierConfig) -> Self {
        Self {
            path: None,
            defaults: RwLock::new(defaults),
        }
    }

    /// Load defaults from `path` plus environment overrides. Never fails.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let defaults = Self::read(&path);
        info!(
            path = %path.display(),
            enabled = defaults.enabled,
            debug = defaults.debug,
            excluded = defaults.excluded_class_tags.len(),
            "Loaded cache bypass configuration"
        );
        Self {
            path: Some(path),
            defaults: RwLock::new(defaults),
        }
    }

    fn read(path: &Path) -> ClassifierConfig {
        let mut config = ClassifierConfig::from_file(path);
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current process-wide defaults
    pub fn defaults(&self) -> ClassifierConfig {
        self.defaults.read().clone()
    }

    /// Re-read the backing file. Stores without a file keep their defaults.
    pub fn reload(&self) -> ClassifierConfig {
        if let Some(path) = &self.path {
            let fresh = Self::read(path);
            *self.defaults.write() = fresh;
            info!(path = %path.display(), "Reloaded cache bypass configuration");
        }
        self.defaults()
    }

    /// Replace the defaults
    pub fn update_defaults(&self, update: impl FnOnce(&mut ClassifierConfig)) -> ClassifierConfig {
        let mut defaults = self.defaults.write();
        update(&mut defaults);
        defaults.clone()
    }

    /// Write the current defaults to the backing file
    pub fn save(&self) -> Result<(), CoreError> {
        let path = self.path.as_ref().ok_or_else(|| {
            CoreError::ConfigurationError("configuration store has no backing file".to_string())
        })?;
        let text = serde_json::to_string_pretty(&self.defaults())?;
        std::fs::write(path, text)?;
        info!(path = %path.display(), "Saved cache bypass configuration");
        Ok(())
    }

    /// Defaults merged with an explicit override
    pub fn effective_with(&self, config_override: Option<&ConfigOverride>) -> ClassifierConfig {
        let defaults = self.defaults.read();
        match config_override {
            Some(config_override) => config_override.apply(&defaults),
            None => defaults.clone(),
        }
    }

    /// Defaults merged with the override of the run bound to the current task
    pub fn effective(&self) -> ClassifierConfig {
        let current = RunScope::current().map(|scope| scope.config_override());
        self.effective_with(current.as_ref())
    }
}
