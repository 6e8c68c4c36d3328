//! Application configuration, loaded from an optional YAML file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthConfig;
use crate::engine::{EngineConfig, RecoveryConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Default tracing directive; `RUST_LOG` takes precedence.
    pub log_level: String,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub recovery: RecoveryConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP address or host name to listen on.
    pub host: String,
    pub port: u16,
    /// Directory served for any path no route matches.
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            static_dir: None,
        }
    }
}

impl ServerConfig {
    /// `host:port`, resolved when the listener binds. IPv6 literals are
    /// bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Where account and ledger journals live. Without a data dir all state is
/// kept in memory and lost on exit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn accounts_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("accounts.csv"))
    }

    pub fn ledger_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("ledger.csv"))
    }
}

impl AppConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default().with_log_level());
        };

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(yaml: &str) -> Result<Self, serde_yaml::Error> {
        // an empty file deserializes to unit, not to an empty map
        if yaml.trim().is_empty() {
            return Ok(Self::default().with_log_level());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        Ok(config.with_log_level())
    }

    fn with_log_level(mut self) -> Self {
        if self.log_level.is_empty() {
            self.log_level = "info".to_string();
        }
        self
    }
}
