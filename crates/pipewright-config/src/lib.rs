//! # Pipewright Config
//!
//! Unified single-file configuration management for Pipewright. A single
//! `pipewright.yaml` configures the engine, intervention policy, timeout
//! monitor, stores, and observability settings.

mod loader;

pub use loader::{load_config, ConfigError};

use serde::Deserialize;
use std::time::Duration;

/// Top-level configuration schema for Pipewright.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipewrightConfig {
    pub app: AppConfig,
    pub engine: EngineConfig,
    pub intervention: InterventionConfig,
    pub timeouts: TimeoutMonitorConfig,
    pub stores: StoresConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "pipewright".to_string(),
            environment: "development".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local retries on a lost compare-and-swap race before the update is
    /// reported as failed.
    pub cas_retry_budget: u32,
    /// Capacity of the broadcast event bus.
    pub event_bus_capacity: usize,
    /// Upper bound on children executed in parallel under one parent.
    pub max_parallel_children: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cas_retry_budget: 3,
            event_bus_capacity: 1024,
            max_parallel_children: 8,
        }
    }
}

/// Manual-intervention policy. The auto-resolve action is configuration,
/// never hard-coded.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterventionConfig {
    /// Default wait before auto-resolving, in seconds. 24 hours.
    pub default_timeout_secs: u64,
    /// Action applied when the wait expires: abort, mark_failed,
    /// mark_success, retry, or ignore.
    pub default_action: String,
}

impl InterventionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 24 * 60 * 60,
            default_action: "abort".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutMonitorConfig {
    /// Interval between monitor scans, in milliseconds.
    pub scan_interval_ms: u64,
    /// Retries for timeout-instance cleanup after a terminal transition.
    pub cleanup_retries: u32,
    /// Base backoff between cleanup retries, in milliseconds.
    pub cleanup_backoff_ms: u64,
}

impl TimeoutMonitorConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn cleanup_backoff(&self) -> Duration {
        Duration::from_millis(self.cleanup_backoff_ms)
    }
}

impl Default for TimeoutMonitorConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 1000,
            cleanup_retries: 3,
            cleanup_backoff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoresConfig {
    pub node: StoreSpec,
    pub interrupt: StoreSpec,
    pub timeout: StoreSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSpec {
    pub backend: String,
    pub connection_url: Option<String>,
}

impl Default for StoreSpec {
    fn default() -> Self {
        Self {
            backend: "in_memory".to_string(),
            connection_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_file: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}
