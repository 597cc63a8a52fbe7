//! Application settings (`switchboard.yaml`).
//!
//! Every field has a default, so a missing file or a partial one is fine.
//! `${VAR}` / `${VAR:-default}` references are expanded before parsing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::inference::config::{expand_tilde, interpolate_env_vars};
use crate::inference::ModelConfig;
use crate::mcp_client::{DiscoverySettings, SupervisorSettings};

/// File name searched for when no explicit path is given.
pub const CONFIG_FILE_NAME: &str = "switchboard.yaml";

/// Environment variable naming an explicit settings file.
pub const CONFIG_ENV_VAR: &str = "SWITCHBOARD_CONFIG";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid setting: {reason}")]
    Invalid { reason: String },
}

// ─── Settings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AppConfig {
    /// Provider document location.
    #[serde(default = "default_providers_file")]
    pub providers_file: String,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    /// Per-request timeout for provider sessions.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub settle_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub port_start: u16,
    pub port_end: u16,
    pub probe_timeout_ms: u64,
    pub concurrency: usize,
}

fn default_providers_file() -> String {
    "mcp_servers.json".to_string()
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            providers_file: default_providers_file(),
            model: ModelConfig::default(),
            supervisor: SupervisorSection::default(),
            discovery: DiscoverySection::default(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            settle_ms: 2_000,
            shutdown_timeout_ms: 5_000,
            probe_timeout_ms: 5_000,
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            port_start: 8000,
            port_end: 8999,
            probe_timeout_ms: 2_000,
            concurrency: 32,
        }
    }
}

impl AppConfig {
    pub fn providers_path(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.providers_file))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            settle: Duration::from_millis(self.supervisor.settle_ms),
            shutdown_timeout: Duration::from_millis(self.supervisor.shutdown_timeout_ms),
            probe_timeout: Duration::from_millis(self.supervisor.probe_timeout_ms),
        }
    }

    pub fn discovery_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            ports: self.discovery.port_start..=self.discovery.port_end,
            probe_timeout: Duration::from_millis(self.discovery.probe_timeout_ms),
            concurrency: self.discovery.concurrency.max(1),
        }
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.discovery.port_start > self.discovery.port_end {
            return Err(SettingsError::Invalid {
                reason: format!(
                    "discovery.port_start ({}) is above discovery.port_end ({})",
                    self.discovery.port_start, self.discovery.port_end
                ),
            });
        }
        if self.providers_file.trim().is_empty() {
            return Err(SettingsError::Invalid {
                reason: "providers_file is empty".to_string(),
            });
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate `switchboard.yaml`.
///
/// Search order:
/// 1. `SWITCHBOARD_CONFIG`, if it names an existing file
/// 2. Walk upward from `start` looking for `switchboard.yaml`
pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.is_file() {
            return Some(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} does not name a file, searching instead");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Read and parse one settings file.
pub fn load_app_config(path: &Path) -> Result<AppConfig, SettingsError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let interpolated = interpolate_env_vars(&raw);
    let config: AppConfig = if interpolated.trim().is_empty() {
        AppConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| SettingsError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    };

    config.validate()?;
    Ok(config)
}

/// Settings found from `start`, or the defaults when there is no file.
pub fn load_or_default(start: &Path) -> Result<AppConfig, SettingsError> {
    match find_config_path(start) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading settings");
            load_app_config(&path)
        }
        None => {
            tracing::info!("no {CONFIG_FILE_NAME} found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
