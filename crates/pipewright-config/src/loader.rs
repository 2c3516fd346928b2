//! Configuration loading.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::PipewrightConfig;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

const REPAIR_ACTIONS: &[&str] = &["abort", "mark_failed", "mark_success", "retry", "ignore"];

/// Load the full Pipewright configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<PipewrightConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: PipewrightConfig = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &PipewrightConfig) -> Result<(), ConfigError> {
    if config.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "app.name must not be empty".to_string(),
        ));
    }

    if config.engine.max_parallel_children == 0 {
        return Err(ConfigError::Invalid(
            "engine.max_parallel_children must be > 0".to_string(),
        ));
    }

    if config.timeouts.scan_interval_ms == 0 {
        return Err(ConfigError::Invalid(
            "timeouts.scan_interval_ms must be > 0".to_string(),
        ));
    }

    if !REPAIR_ACTIONS.contains(&config.intervention.default_action.as_str()) {
        return Err(ConfigError::Invalid(format!(
            "intervention.default_action must be one of {REPAIR_ACTIONS:?}, got '{}'",
            config.intervention.default_action
        )));
    }

    Ok(())
}
