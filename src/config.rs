//! Persistent application configuration
//!
//! Stored as JSON at `<data_dir>/lapsync/config.json`. Every field has a
//! default, so a missing or partial file still yields a usable config.
//! `PORT` and `LAPSYNC_DB` override the file.

use lapsync_core::EngineConfig;
use lapsync_server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_port() -> u16 {
    8920
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_broadcast_capacity() -> usize {
    lapsync_core::DEFAULT_BROADCAST_CAPACITY
}

fn default_clear_retry_attempts() -> u32 {
    3
}

fn default_clear_retry_backoff_ms() -> u64 {
    200
}

/// Persistent application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// SQLite file; laps are kept in memory only when unset
    #[serde(default)]
    pub database: Option<PathBuf>,
    /// Events a connection may lag before it is resynced from a snapshot
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_clear_retry_attempts")]
    pub clear_retry_attempts: u32,
    #[serde(default = "default_clear_retry_backoff_ms")]
    pub clear_retry_backoff_ms: u64,
    /// Directory for daily log files (None = console only)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_addr: default_bind_addr(),
            database: None,
            broadcast_capacity: default_broadcast_capacity(),
            clear_retry_attempts: default_clear_retry_attempts(),
            clear_retry_backoff_ms: default_clear_retry_backoff_ms(),
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Config file path: `<data_dir>/lapsync/config.json`
    pub fn path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lapsync")
            .join("config.json")
    }

    /// Load config from the default path with environment overrides applied
    pub fn load() -> Self {
        let mut config = Self::load_from(&Self::path());
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Load config from `path`, falling back to defaults on any error
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded config from disk");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Apply `PORT` and `LAPSYNC_DB` from `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(_) => tracing::warn!(%port, "Ignoring invalid PORT"),
            }
        }
        if let Some(db) = lookup("LAPSYNC_DB") {
            self.database = if db.is_empty() {
                None
            } else {
                Some(PathBuf::from(db))
            };
        }
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            bind_addr: self.bind_addr.clone(),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            clear_retry_attempts: self.clear_retry_attempts,
            clear_retry_backoff: Duration::from_millis(self.clear_retry_backoff_ms),
            broadcast_capacity: self.broadcast_capacity,
        }
    }
}
