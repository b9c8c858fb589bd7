//! ScatterFS peer configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default configuration constants
///
/// This module centralizes all default values used throughout ScatterFS.
/// By collecting these constants in one place, we ensure consistency
/// and make it easier to adjust defaults for different deployment scenarios.
pub mod defaults {

    // Storage defaults
    /// Default chunk size: 512KB
    /// Small enough that medium files still spread across several peers,
    /// large enough to keep per-chunk request overhead low
    pub const CHUNK_SIZE: u64 = 512 * 1024;

    // Network defaults
    /// Request timeout: 30 seconds
    pub const TIMEOUT_SECS: u64 = 30;

    /// Maximum send attempts per request (first try + retries)
    pub const MAX_RETRIES: u32 = 3;

    /// Base backoff between retries in milliseconds; each attempt adds a
    /// hash-derived jitter so a burst of failing clients does not retry in
    /// lockstep
    pub const RETRY_BACKOFF_MS: u64 = 10;

    // Log level
    /// Default log level
    pub const fn default_log_level() -> &'static str {
        "info"
    }
}

/// How filesystem objects are identified across the deployment
///
/// All peers must agree on the mode: the identity string feeds both the
/// distributor and the chunk directory naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingMode {
    /// The absolute path is the identity. Rename moves chunk ownership.
    Path,
    /// A uid minted at create time is the identity; it survives rename.
    Uid,
}

/// ScatterFS peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Peer node configuration
    pub node: NodeConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Network configuration
    pub network: NetworkConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node ID (unique identifier, must appear in network.peers)
    pub node_id: String,

    /// Data directory for the local chunk storage
    pub data_dir: PathBuf,

    /// Object addressing mode, identical on every peer
    #[serde(default = "default_addressing_mode")]
    pub addressing_mode: AddressingMode,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_addressing_mode() -> AddressingMode {
    AddressingMode::Path
}

fn default_log_level() -> String {
    defaults::default_log_level().to_string()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Chunk size in bytes. Placement arithmetic on every peer and client
    /// depends on this value, so it must be identical deployment-wide.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
}

fn default_chunk_size() -> u64 {
    defaults::CHUNK_SIZE
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// All peer node IDs of the deployment, in the shared deployment order.
    /// The position of a node ID in this list is its peer index.
    pub peers: Vec<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum send attempts per request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry backoff in milliseconds
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_timeout() -> u64 {
    defaults::TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    defaults::MAX_RETRIES
}

fn default_retry_backoff() -> u64 {
    defaults::RETRY_BACKOFF_MS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                node_id: "node1".to_string(),
                data_dir: PathBuf::from("/tmp/scatterfs"),
                addressing_mode: default_addressing_mode(),
                log_level: default_log_level(),
            },
            storage: StorageConfig {
                chunk_size: default_chunk_size(),
            },
            network: NetworkConfig {
                peers: vec!["node1".to_string()],
                timeout_secs: default_timeout(),
                max_retries: default_max_retries(),
                retry_backoff_ms: default_retry_backoff(),
            },
        }
    }
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("Failed to read config file: {}", e)))?;

        let config: ServerConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(|e| {
            ConfigError::SerializeError(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteError(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Index of the local node in the shared peer ordering
    pub fn localhost_index(&self) -> Result<usize, ConfigError> {
        self.network
            .peers
            .iter()
            .position(|p| *p == self.node.node_id)
            .ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "Node ID {} not listed in network.peers",
                    self.node.node_id
                ))
            })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate node ID
        if self.node.node_id.is_empty() {
            return Err(ConfigError::ValidationError(
                "Node ID cannot be empty".to_string(),
            ));
        }

        // Validate chunk size (must be > 0 and <= 128MB)
        if self.storage.chunk_size == 0 || self.storage.chunk_size > 128 * 1024 * 1024 {
            return Err(ConfigError::ValidationError(
                "Chunk size must be between 1 and 128MB".to_string(),
            ));
        }

        // Validate peer list
        if self.network.peers.is_empty() {
            return Err(ConfigError::ValidationError(
                "Peer list cannot be empty".to_string(),
            ));
        }
        self.localhost_index()?;

        if self.network.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "max_retries must be at least 1".to_string(),
            ));
        }

        // Validate log level
        match self.node.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.node.log_level
                )));
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
