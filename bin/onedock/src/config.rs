//! Daemon configuration
//!
//! Loaded from a YAML file when one is given, defaults otherwise. The
//! container section carries the keys the core consumes; server and logging
//! configure the daemon itself.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Single-line compact format
    Compact,
    /// JSON format for log aggregation
    Json,
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Keys consumed by the orchestration core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Prefix for container names and labels
    pub prefix: String,
    /// First host port handed to replicas
    pub internal_port_start: u16,
    /// Mapping cache TTL in seconds
    pub cache_ttl: u64,
    /// round_robin, least_connections or weighted; unknown values degrade
    /// to round_robin
    pub load_balance_strategy: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            prefix: "onedock".to_string(),
            internal_port_start: 30000,
            cache_ttl: 300,
            load_balance_strategy: "round_robin".to_string(),
        }
    }
}

/// Management API server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the management API
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OnedockConfig {
    pub container: ContainerConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl OnedockConfig {
    /// Load from a YAML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }
}
