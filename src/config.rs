use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::DispatcherConfig;
use crate::scheduler::RunnerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

/// Handlers wired to the built-in state table's actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    /// Planner endpoint that receives `run_slice` requests.
    pub slice_webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            slice_webhook_url: None,
            webhook_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// PostgreSQL connection string. Without one the in-memory store is used.
    pub database_url: Option<String>,
    /// YAML state table. Falls back to the database tables, then the built-in table.
    pub state_table_path: Option<PathBuf>,
    pub dispatcher: DispatcherConfig,
    pub runner: RunnerConfig,
    pub api: ApiConfig,
    pub actions: ActionsConfig,
}

impl Config {
    /// Defaults, then the TOML file at `path` (or `PDCA_CONFIG`), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var("PDCA_CONFIG").ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            self.database_url = Some(url);
        }
        if let Some(path) = lookup("PDCA_STATE_TABLE").filter(|v| !v.is_empty()) {
            self.state_table_path = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("PDCA_SLICE_WEBHOOK_URL").filter(|v| !v.is_empty()) {
            self.actions.slice_webhook_url = Some(url);
        }
        if let Some(worker_id) = lookup("PDCA_WORKER_ID").filter(|v| !v.is_empty()) {
            self.runner.worker_id = worker_id;
        }

        parse_env(&lookup, "PDCA_API_PORT", &mut self.api.port)?;
        parse_env(&lookup, "PDCA_POLL_INTERVAL_MS", &mut self.runner.poll_interval_ms)?;
        parse_env(&lookup, "PDCA_BATCH_LIMIT", &mut self.runner.batch_limit)?;
        parse_env(&lookup, "PDCA_LEASE_SECONDS", &mut self.runner.lease_seconds)?;
        parse_env(
            &lookup,
            "PDCA_DISPATCH_COOLDOWN_SECONDS",
            &mut self.runner.dispatch_cooldown_seconds,
        )?;
        parse_env(&lookup, "PDCA_INTERACTIVE_BOOST", &mut self.runner.interactive_boost)?;
        parse_env(
            &lookup,
            "PDCA_STARVATION_THRESHOLD_SECONDS",
            &mut self.runner.starvation_threshold_seconds,
        )?;
        parse_env(
            &lookup,
            "PDCA_STARVATION_SCAN_LIMIT",
            &mut self.runner.starvation_scan_limit,
        )?;
        parse_env(&lookup, "PDCA_TICK_INTERVAL_MS", &mut self.dispatcher.tick_interval_ms)?;
        parse_env(&lookup, "PDCA_MAX_DEPTH", &mut self.dispatcher.max_depth)?;
        Ok(())
    }
}

fn parse_env<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(value) = lookup(key) else {
        return Ok(());
    };
    *target = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value,
    })?;
    Ok(())
}
