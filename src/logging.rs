//! Structured logging via the `tracing` crate.
//!
//! Configurable level, format, and per-module directives, with `GROVE_LOG`
//! and `GROVE_LOG_FORMAT` environment overrides taking precedence over the
//! configuration file.

use crate::error::RepositoryError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Whether logging is enabled (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log level: trace, debug, info, warn, error, off.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: json, text (default: text).
    #[serde(default = "default_format")]
    pub format: String,

    /// Module-specific log levels.
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            level: default_log_level(),
            format: default_format(),
            modules: HashMap::new(),
        }
    }
}

/// Initialize the logging system. Call once at repository start-up.
pub fn init_logging(config: Option<&LoggingConfig>) -> Result<(), RepositoryError> {
    let disabled = config.map(|c| !c.enabled).unwrap_or(false);
    if disabled {
        Registry::default().with(EnvFilter::new("off")).init();
        return Ok(());
    }

    let filter = build_env_filter(config)?;
    let format = determine_format(config)?;

    if format == "json" {
        Registry::default()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

/// Build the environment filter: `GROVE_LOG` wins outright, otherwise the
/// configured level plus module directives.
fn build_env_filter(config: Option<&LoggingConfig>) -> Result<EnvFilter, RepositoryError> {
    if let Ok(filter) = EnvFilter::try_from_env("GROVE_LOG") {
        return Ok(filter);
    }

    let level = config.map(|c| c.level.as_str()).unwrap_or("info");
    if level == "off" {
        return Ok(EnvFilter::new("off"));
    }

    let mut filter = EnvFilter::new(level);
    if let Some(config) = config {
        for (module, module_level) in &config.modules {
            let directive = format!("{}={}", module, module_level);
            filter = filter.add_directive(directive.parse().map_err(|e| {
                RepositoryError::Config(format!("Invalid log directive: {}", e))
            })?);
        }
    }
    Ok(filter)
}

fn determine_format(config: Option<&LoggingConfig>) -> Result<String, RepositoryError> {
    if let Ok(format) = std::env::var("GROVE_LOG_FORMAT") {
        if format == "json" || format == "text" {
            return Ok(format);
        }
    }
    let format = config.map(|c| c.format.as_str()).unwrap_or("text");
    if format != "json" && format != "text" {
        return Err(RepositoryError::Config(format!(
            "Invalid log format: {} (must be 'json' or 'text')",
            format
        )));
    }
    Ok(format.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logging_config() {
        let config = LoggingConfig::default();
        assert!(config.enabled);
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "text");
        assert!(config.modules.is_empty());
    }

    #[test]
    fn test_invalid_format_is_rejected() {
        let mut config = LoggingConfig::default();
        config.format = "xml".to_string();
        assert!(determine_format(Some(&config)).is_err());
    }

    #[test]
    fn test_module_directives_parse() {
        let mut config = LoggingConfig::default();
        config
            .modules
            .insert("grove::bus".to_string(), "debug".to_string());
        assert!(build_env_filter(Some(&config)).is_ok());
    }

    #[test]
    fn test_bad_module_directive_is_rejected() {
        let mut config = LoggingConfig::default();
        config
            .modules
            .insert("grove::bus".to_string(), "not a level".to_string());
        assert!(build_env_filter(Some(&config)).is_err());
    }
}
