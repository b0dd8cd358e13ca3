//! Orchestrator configuration.
//!
//! Settings controlling container naming, runtime selection and subprocess
//! timeouts, loadable from a TOML file. Every field has a default, so a
//! partial file (or none at all) yields a working configuration.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::runtime::ContainerRuntime;

/// Container name prefixes must be valid leading name segments.
static NAME_PREFIX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap());

/// Errors that can occur during configuration operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),
}

/// Settings for the container orchestration layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Leading segment of every managed container name
    pub name_prefix: String,
    /// Separator between name segments
    pub name_separator: String,
    /// Runtimes to probe, in order of preference
    pub runtime_preference: Vec<ContainerRuntime>,
    /// Explicit runtime binary, overriding PATH lookup of the selected
    /// runtime's own name
    pub binary_path: Option<PathBuf>,
    /// Deadline for one-shot lifecycle commands, in milliseconds
    pub command_timeout_ms: u64,
    /// Default deadline for exec calls, in milliseconds
    pub exec_timeout_ms: u64,
    /// Deadline for image builds, in milliseconds
    pub build_timeout_ms: u64,
    /// Grace period passed to `stop --time`, in seconds
    pub stop_timeout_secs: u64,
    /// How long long-lived children get between SIGTERM and force-kill,
    /// in milliseconds
    pub shutdown_grace_ms: u64,
    /// Event kinds the monitor subscribes to when none are given
    pub default_event_types: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            name_prefix: "apex".to_string(),
            name_separator: "-".to_string(),
            runtime_preference: vec![ContainerRuntime::Docker, ContainerRuntime::Podman],
            binary_path: None,
            command_timeout_ms: 60_000,  // 1 minute
            exec_timeout_ms: 30_000,     // 30 seconds
            build_timeout_ms: 300_000,   // 5 minutes
            stop_timeout_secs: 10,
            shutdown_grace_ms: 5_000,
            default_event_types: vec![
                "die".to_string(),
                "start".to_string(),
                "stop".to_string(),
                "create".to_string(),
                "destroy".to_string(),
            ],
        }
    }
}

impl OrchestratorConfig {
    /// Load and validate a configuration file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the default config file, or fall back to defaults when it does
    /// not exist.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = Self::default_config_path();
        if path.exists() {
            Self::load_from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the configuration to a TOML file, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Platform config location: `<config dir>/apexbox/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("apexbox")
            .join("config.toml")
    }

    /// Check invariants that serde defaults alone cannot enforce.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "name_prefix must not be empty".to_string(),
            ));
        }
        if !NAME_PREFIX_PATTERN.is_match(&self.name_prefix) {
            return Err(ConfigError::ValidationError(format!(
                "name_prefix '{}' is not a valid container name segment",
                self.name_prefix
            )));
        }
        if self.name_separator.is_empty() {
            return Err(ConfigError::ValidationError(
                "name_separator must not be empty".to_string(),
            ));
        }
        if self.runtime_preference.is_empty() {
            return Err(ConfigError::ValidationError(
                "runtime_preference must name at least one runtime".to_string(),
            ));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "command_timeout_ms must be positive".to_string(),
            ));
        }
        if self.exec_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "exec_timeout_ms must be positive".to_string(),
            ));
        }
        if self.build_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "build_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
