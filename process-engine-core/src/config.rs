use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine tuning loaded from YAML. Every field has a default so an empty
/// document is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Work items processed by one drive before control returns to the caller.
    /// Unprocessed items stay recoverable through `recover_process_instance`.
    pub max_steps_per_drive: usize,
    pub connector_timeout_ms: u64,
    /// Lock table size above which idle entries are dropped.
    pub lock_prune_threshold: usize,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_drive: 10_000,
            connector_timeout_ms: 30_000,
            lock_prune_threshold: 1024,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            with_target: true,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(yaml).context("Failed to parse engine config YAML")?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Reading {}", path.display()))?;
        Self::from_yaml_str(&content).with_context(|| format!("Parsing {}", path.display()))
    }
}
