// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 farmlink contributors

//! Broker configuration.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port to listen on (default: 3000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Poll scheduler period in seconds (default: 60)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum seconds between two accepted archival writes for the
    /// same chip (default: 1800)
    #[serde(default = "default_archival_interval")]
    pub archival_interval_secs: u64,

    /// Maximum frame size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Per-connection outbound queue capacity. Deliveries to a full
    /// queue are dropped, so this bounds how far a peer that stops
    /// reading can fall behind before it starts losing messages.
    #[serde(default = "default_outbound_queue_len")]
    pub outbound_queue_len: usize,

    /// SQLite database path for archived readings
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    3000
}

fn default_poll_interval() -> u64 {
    60
}

fn default_archival_interval() -> u64 {
    30 * 60
}

fn default_max_message_size() -> usize {
    64 * 1024
}

fn default_outbound_queue_len() -> usize {
    100
}

fn default_db_path() -> String {
    "farmlink.db".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            poll_interval_secs: default_poll_interval(),
            archival_interval_secs: default_archival_interval(),
            max_message_size: default_max_message_size(),
            outbound_queue_len: default_outbound_queue_len(),
            db_path: default_db_path(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Poll scheduler period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Archival rate-limit interval.
    pub fn archival_interval(&self) -> Duration {
        Duration::from_secs(self.archival_interval_secs)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "poll_interval_secs cannot be 0".into(),
            ));
        }
        if self.archival_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "archival_interval_secs cannot be 0".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidValue(
                "max_message_size cannot be 0".into(),
            ));
        }
        if self.outbound_queue_len == 0 {
            return Err(ConfigError::InvalidValue(
                "outbound_queue_len cannot be 0".into(),
            ));
        }
        if self.db_path.is_empty() {
            return Err(ConfigError::InvalidValue("db_path cannot be empty".into()));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}
