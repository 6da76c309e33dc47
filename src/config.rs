//! Configuration loading.
//!
//! TOML file with a `[runtime]` section, `[selection]` tuning, an optional
//! `[telemetry]` source, and a `[[providers]]` descriptor list. Discovery
//! order: explicit path, `./foreman.toml`, then `~/.foreman/config.toml`.
//! A missing or empty provider list is fatal; the orchestrator will not
//! start on guesswork.

use crate::error::ConfigError;
use crate::provider::ProviderDescriptor;
use crate::telemetry::TelemetryThresholds;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForemanConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    pub poll_interval_secs: u64,
    pub max_concurrent_tasks: usize,
    /// Default execution-failure budget for packets that don't carry one.
    pub default_max_attempts: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            max_concurrent_tasks: 3,
            default_max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectionConfig {
    pub high_load_threshold: u64,
    pub success_rate_floor: f64,
    pub demote_delta: i32,
    pub promote_delta: i32,
    pub nudge_ttl_secs: u64,
    pub rate_limit_cooldown_secs: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            high_load_threshold: 50,
            success_rate_floor: 0.3,
            demote_delta: 10,
            promote_delta: 2,
            nudge_ttl_secs: 300,
            rate_limit_cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    pub api_url: String,
    #[serde(default = "default_cadence")]
    pub cadence_secs: u64,
}

fn default_cadence() -> u64 {
    60
}

impl ForemanConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ForemanConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "loading config");
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).expect("config serializes to toml")
    }

    /// Find and load configuration: explicit override first, then the
    /// working directory, then the user config directory.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_toml_file(path);
        }

        let mut locations = vec![PathBuf::from("foreman.toml")];
        if let Some(home) = std::env::home_dir() {
            locations.push(home.join(".foreman").join("config.toml"));
        }

        for location in &locations {
            if location.exists() {
                info!(path = %location.display(), "using discovered config");
                return Self::from_toml_file(location);
            }
        }

        Err(ConfigError::Io {
            path: locations
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no config file found"),
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.providers.iter().any(|p| p.enabled) {
            return Err(ConfigError::EmptyRegistry);
        }
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(&provider.name) {
                return Err(ConfigError::DuplicateProvider(provider.name.clone()));
            }
        }
        Ok(())
    }

    pub fn thresholds(&self) -> TelemetryThresholds {
        TelemetryThresholds {
            high_load_threshold: self.selection.high_load_threshold,
            success_rate_floor: self.selection.success_rate_floor,
            demote_delta: self.selection.demote_delta,
            promote_delta: self.selection.promote_delta,
            nudge_ttl: chrono::Duration::seconds(self.selection.nudge_ttl_secs as i64),
        }
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.selection.rate_limit_cooldown_secs as i64)
    }
}
