//! Classifier configuration
//!
//! The process-wide defaults are read from a JSON file with the keys
//! `enabled`, `debug` and `node_class`. A missing or malformed file is never
//! fatal: defaults apply.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

/// Environment variable overriding `enabled`
pub const ENV_ENABLED: &str = "NOCACHE_ENABLED";

/// Environment variable overriding `debug`
pub const ENV_DEBUG: &str = "NOCACHE_DEBUG";

/// Effective caching rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Whether caching rules are applied at all
    pub enabled: bool,

    /// Emit skip notices and the post-run memory report
    pub debug: bool,

    /// Class tags that are never cached
    #[serde(rename = "node_class")]
    pub excluded_class_tags: BTreeSet<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug: false,
            excluded_class_tags: BTreeSet::new(),
        }
    }
}

impl ClassifierConfig {
    /// Add an excluded class tag
    pub fn exclude_class(mut self, class_type: impl Into<String>) -> Self {
        self.excluded_class_tags.insert(class_type.into());
        self
    }

    /// Read a config file, falling back to defaults when it is absent or malformed
    pub fn from_file(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file at {}, using defaults", path.display());
                return Self::default();
            }
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                return Self::default();
            }
        };

        match serde_json::from_str::<Self>(&text) {
            Ok(config) => config,
            Err(e) => {
                warn!("Malformed config file {}, using defaults: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Apply `NOCACHE_ENABLED` / `NOCACHE_DEBUG` style overrides.
    ///
    /// `lookup` maps a variable name to its value; invalid values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_ENABLED) {
            match parse_flag(&raw) {
                Some(enabled) => self.enabled = enabled,
                None => warn!("Invalid {} value: {}", ENV_ENABLED, raw),
            }
        }

        if let Some(raw) = lookup(ENV_DEBUG) {
            match parse_flag(&raw) {
                Some(debug) => self.debug = debug,
                None => warn!("Invalid {} value: {}", ENV_DEBUG, raw),
            }
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Per-run override of the process-wide defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigOverride {
    /// Replacement for `enabled`
    pub enabled: Option<bool>,
    /// Replacement for `debug`
    pub debug: Option<bool>,
}

impl ConfigOverride {
    /// Whether the override changes anything
    pub fn is_empty(&self) -> bool {
        self.enabled.is_none() && self.debug.is_none()
    }

    /// Merge this override on top of `base`
    pub fn apply(&self, base: &ClassifierConfig) -> ClassifierConfig {
        let mut merged = base.clone();
        if let Some(enabled) = self.enabled {
            merged.enabled = enabled;
        }
        if let Some(debug) = self.debug {
            merged.debug = debug;
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ClassifierConfig::default();
        assert!(config.enabled);
        assert!(!config.debug);
        assert!(config.excluded_class_tags.is_empty());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClassifierConfig::from_file(&dir.path().join("config.json"));
        assert_eq!(config, ClassifierConfig::default());
    }

    #[test]
    fn test_partial_file_and_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"debug": true, "node_class": ["PreviewImage"], "colour": "blue"}}"#).unwrap();

        let config = ClassifierConfig::from_file(file.path());
        assert_eq!(
            config,
            ClassifierConfig {
                enabled: true,
                debug: true,
                excluded_class_tags: ["PreviewImage".to_string()].into_iter().collect(),
            }
        );
    }

    #[test]
    fn test_malformed_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ enabled: nope").unwrap();

        assert_eq!(ClassifierConfig::from_file(file.path()), ClassifierConfig::default());
    }

    #[test]
    fn test_wrong_types_use_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"enabled": "yes"}}"#).unwrap();

        assert_eq!(ClassifierConfig::from_file(file.path()), ClassifierConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [(ENV_ENABLED, "0"), (ENV_DEBUG, "maybe")].into_iter().collect();
        let mut config = ClassifierConfig::default();

        config.apply_env_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert!(!config.enabled);
        // invalid value leaves the field untouched
        assert!(!config.debug);
    }

    #[test]
    fn test_override_apply() {
        let base = ClassifierConfig::default().exclude_class("VAEDecode");
        let merged = ConfigOverride {
            enabled: None,
            debug: Some(true),
        }
        .apply(&base);

        assert!(merged.enabled);
        assert!(merged.debug);
        assert!(merged.excluded_class_tags.contains("VAEDecode"));
        assert!(ConfigOverride::default().is_empty());
    }
}
