// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use crate::config::consts::{
    DEFAULT_BUS_MAX_LEN, DEFAULT_CLAIM_TIMEOUT_MS, DEFAULT_POLL_TIMEOUT_MS,
    DEFAULT_PUBLISH_ATTEMPTS, DEFAULT_PUBLISH_BACKOFF_MS,
};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main configuration structure for the stream runtime.
///
/// Covers the three externally configurable subsystems: the message bus,
/// the persistent store, and logging. Typically loaded from a TOML file,
/// but `RuntimeConfig::default()` yields a fully local, in-process setup
/// (no broker, in-memory storage) that needs no file at all.
///
/// # Fields
/// * `bus` - Message bus connection and delivery tuning (optional)
/// * `storage` - Persistent store backend selection (optional)
/// * `log_filter` - Tracing filter directive, e.g. `"freshet=debug"` (optional)
///
/// # Example
/// ```toml
/// log_filter = "freshet=info"
///
/// [bus]
/// url = "redis://127.0.0.1:6379"
/// max_len = 50000
///
/// [storage]
/// kind = "hybrid"
/// path = "/var/lib/freshet/streams.db"
/// autosave_secs = 30
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log_filter: Option<String>,
}

/// Message bus tuning.
///
/// When `url` is absent the runtime falls back to the in-process broker,
/// which honours the same retention and redelivery settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Broker connection string, e.g. `redis://127.0.0.1:6379`.
    #[serde(default)]
    pub url: Option<String>,
    /// Retained entries per topic; oldest are trimmed past this.
    #[serde(default = "default_bus_max_len")]
    pub max_len: usize,
    /// How long a blocking consumer read waits for new entries.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Publish attempts before the publish fails outright.
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
    /// Initial backoff between publish attempts; doubles each retry.
    #[serde(default = "default_publish_backoff_ms")]
    pub publish_backoff_ms: u64,
    /// Unacknowledged deliveries older than this are claimable by
    /// other consumers in the same group.
    #[serde(default = "default_claim_timeout_ms")]
    pub claim_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            url: None,
            max_len: DEFAULT_BUS_MAX_LEN,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            publish_attempts: DEFAULT_PUBLISH_ATTEMPTS,
            publish_backoff_ms: DEFAULT_PUBLISH_BACKOFF_MS,
            claim_timeout_ms: DEFAULT_CLAIM_TIMEOUT_MS,
        }
    }
}

/// Persistent store backend selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub kind: StorageKind,
    /// SQLite database path; required for `file` and `hybrid`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Per-namespace record cap; oldest records are evicted past this.
    #[serde(default)]
    pub max_size: Option<usize>,
    /// Hybrid mode only: flush buffered writes this often instead of on
    /// every write.
    #[serde(default)]
    pub autosave_secs: Option<u64>,
}

/// Where store namespaces keep their records.
///
/// # Variants
/// * `Memory` - Volatile; everything is lost when the process exits
/// * `File` - Every write goes straight to SQLite
/// * `Hybrid` - SQLite-durable with an in-memory read path
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Memory,
    File,
    Hybrid,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("storage kind '{kind:?}' requires a database path")]
    MissingPath { kind: StorageKind },
}

/// Loads and validates a runtime configuration from a TOML file.
pub fn load_config(path: impl AsRef<Path>) -> Result<RuntimeConfig, ConfigError> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: RuntimeConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &RuntimeConfig) -> Result<(), ConfigError> {
    match config.storage.kind {
        StorageKind::Memory => Ok(()),
        kind => {
            if config.storage.path.is_none() {
                Err(ConfigError::MissingPath { kind })
            } else {
                Ok(())
            }
        }
    }
}

fn default_bus_max_len() -> usize {
    DEFAULT_BUS_MAX_LEN
}

fn default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

fn default_publish_attempts() -> u32 {
    DEFAULT_PUBLISH_ATTEMPTS
}

fn default_publish_backoff_ms() -> u64 {
    DEFAULT_PUBLISH_BACKOFF_MS
}

fn default_claim_timeout_ms() -> u64 {
    DEFAULT_CLAIM_TIMEOUT_MS
}
