//! Configuration module
//!
//! Handles loading and saving CoreRPC configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::{self, DEFAULT_COMPLETION_CAPACITY, DEFAULT_MAX_CONCURRENT_REQUESTS};
use crate::protocol::{CodecType, DEFAULT_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Unknown codec: {0}")]
    UnknownCodec(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Log filter directive, e.g. "corerpc=debug" (overrides `verbose`)
    pub log_filter: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Codec requested by clients
    #[serde(default = "default_codec")]
    pub codec: String,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Handlers allowed to run at once on one connection
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Capacity of completion channels allocated by the client
    #[serde(default = "default_completion_capacity")]
    pub completion_capacity: usize,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_codec() -> String {
    CodecType::default().name().to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_max_concurrent_requests() -> usize {
    DEFAULT_MAX_CONCURRENT_REQUESTS
}

fn default_completion_capacity() -> usize {
    DEFAULT_COMPLETION_CAPACITY
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            codec: default_codec(),
            connect_timeout_ms: default_connect_timeout(),
            max_concurrent_requests: default_max_concurrent_requests(),
            completion_capacity: default_completion_capacity(),
        }
    }
}

impl NetworkConfig {
    /// Address the server binds, `bind_address:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Runtime settings for the client and server
    pub fn to_runtime(&self) -> ConfigResult<network::NetworkConfig> {
        let codec = self
            .codec
            .parse::<CodecType>()
            .map_err(ConfigError::UnknownCodec)?;

        Ok(network::NetworkConfig {
            codec,
            connect_timeout_ms: self.connect_timeout_ms,
            completion_capacity: self.completion_capacity,
            ..Default::default()
        }
        .with_max_concurrent_requests(self.max_concurrent_requests))
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths: Vec<PathBuf> = [
            dirs::config_dir().map(|p| p.join("corerpc/config.toml")),
            Some(PathBuf::from("./corerpc.toml")),
            Some(PathBuf::from("./config.toml")),
        ]
        .into_iter()
        .flatten()
        .collect();

        Self::load_first(&config_paths)
    }

    /// Load the first existing file among `paths`, or defaults if none exist.
    ///
    /// A file that exists but cannot be read or parsed is an error.
    pub fn load_first(paths: &[PathBuf]) -> ConfigResult<Self> {
        for path in paths {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            verbose: false,
            log_filter: Some("corerpc=info".to_string()),
        },
        network: NetworkConfig {
            bind_address: "0.0.0.0".to_string(),
            codec: CodecType::Json.name().to_string(),
            ..Default::default()
        },
    };

    Ok(toml::to_string_pretty(&config)?)
}
