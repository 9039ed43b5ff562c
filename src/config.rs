//! Repository configuration.
//!
//! Layered loading: an optional TOML file, overridden by `GROVE_`-prefixed
//! environment variables, with serde defaults underneath.

use crate::error::RepositoryError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfiguration {
    /// Repository name, also used as the repository key on change sets.
    #[serde(default = "default_name")]
    pub name: String,

    /// Workspace used by logins that do not name one.
    #[serde(default = "default_workspace")]
    pub default_workspace: String,

    /// Directory for the sled-backed store; None keeps everything in memory.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,

    /// Interval between lock reaper sweeps, in milliseconds.
    #[serde(default = "default_sweep_interval")]
    pub lock_sweep_interval_ms: u64,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_name() -> String {
    "grove".to_string()
}

fn default_workspace() -> String {
    "default".to_string()
}

fn default_sweep_interval() -> u64 {
    60_000
}

impl Default for RepositoryConfiguration {
    fn default() -> Self {
        RepositoryConfiguration {
            name: default_name(),
            default_workspace: default_workspace(),
            storage_path: None,
            lock_sweep_interval_ms: default_sweep_interval(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RepositoryConfiguration {
    /// Load configuration, layering `file` (when given) under `GROVE_*`
    /// environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self, RepositoryError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("GROVE").separator("__"));
        let settings = builder
            .build()
            .map_err(|e| RepositoryError::Config(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| RepositoryError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RepositoryConfiguration::default();
        assert_eq!(config.name, "grove");
        assert_eq!(config.default_workspace, "default");
        assert!(config.storage_path.is_none());
        assert_eq!(config.lock_sweep_interval_ms, 60_000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grove.toml");
        std::fs::write(
            &path,
            "name = \"content-repo\"\ndefault_workspace = \"main\"\nlock_sweep_interval_ms = 5000\n",
        )
        .unwrap();

        let config = RepositoryConfiguration::load(Some(&path)).unwrap();
        assert_eq!(config.name, "content-repo");
        assert_eq!(config.default_workspace, "main");
        assert_eq!(config.lock_sweep_interval_ms, 5000);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = RepositoryConfiguration::load(None).unwrap();
        assert_eq!(config.default_workspace, "default");
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grove.toml");
        std::fs::write(&path, "name = [not toml").unwrap();
        assert!(RepositoryConfiguration::load(Some(&path)).is_err());
    }
}
