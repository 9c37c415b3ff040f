//! Client configuration.
//!
//! [`ReplConfig`] carries everything the replicated store needs: how to pick
//! node addresses, per-store concurrency, value size limits, control-plane
//! endpoints, and the on-disk ring cache location. Configurations can be
//! built in code or loaded from a TOML file.

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::path::PathBuf;
use std::time::Duration;

/// Complete configuration for a replicated store client.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// Which of a node's multi-homed addresses to dial.
    pub address_index: usize,

    /// Maximum value length in bytes. Larger writes are rejected before any
    /// replica sees them.
    pub value_cap: u32,

    /// In-flight request cap per backend store.
    pub concurrent_requests_per_store: usize,

    /// How long a failed dial is negatively cached before the next operation
    /// re-dials the address.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub failed_connect_retry_delay: Duration,

    /// Explicit control-plane endpoint. When unset, the endpoint is resolved
    /// through the service-discovery hook on every subscription attempt.
    pub ring_server: Option<String>,

    /// Subscriber identifier presented to the control plane.
    pub ring_client_id: String,

    /// Where to persist received rings so restarts can proceed without
    /// immediate control-plane contact. Unset disables the cache.
    pub ring_cache_path: Option<PathBuf>,

    /// Dial options for backend store connections.
    pub transport: TransportOptions,

    /// Dial options for the control-plane connection.
    pub ring_server_transport: TransportOptions,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            address_index: 0,
            value_cap: 4 * 1024 * 1024, // 4MB
            concurrent_requests_per_store: 10,
            failed_connect_retry_delay: Duration::from_secs(15),
            ring_server: None,
            ring_client_id: "pyrite".to_string(),
            ring_cache_path: None,
            transport: TransportOptions::default(),
            ring_server_transport: TransportOptions::default(),
        }
    }
}

/// Transport-layer dial options, passed through to the store factory and the
/// ring source. Opaque to the replication engine itself.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Connection timeout for establishing connections.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,

    /// Request timeout for individual calls.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,

    /// Maximum message size (in bytes).
    pub max_message_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_message_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

impl ReplConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;

        let config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content)?;

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.value_cap == 0 {
            return Err(ConfigError::Validation(
                "value_cap must be at least 1 byte".to_string(),
            ));
        }

        if self.concurrent_requests_per_store == 0 {
            return Err(ConfigError::Validation(
                "concurrent_requests_per_store must be at least 1".to_string(),
            ));
        }

        if self.ring_client_id.is_empty() {
            return Err(ConfigError::Validation(
                "ring_client_id cannot be empty".to_string(),
            ));
        }

        if let Some(server) = &self.ring_server {
            if server.is_empty() {
                return Err(ConfigError::Validation(
                    "ring_server cannot be an empty address".to_string(),
                ));
            }
        }

        if self.transport.request_timeout.is_zero()
            || self.ring_server_transport.request_timeout.is_zero()
        {
            return Err(ConfigError::Validation(
                "request_timeout must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
