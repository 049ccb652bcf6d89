//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod rpc;

pub use messaging::{
    ChannelBusConfig, MessagingConfig, MessagingType, NatsConfig, DEFAULT_CHANNEL_CAPACITY,
};
pub use rpc::{
    RpcConfig, DEFAULT_ENTITY_GROUP, DEFAULT_REQUEST_EXPIRATION, DEFAULT_REQUEST_TIMEOUT,
};

use serde::Deserialize;

use crate::identity::NodeId;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "INGRESS_RPC_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "INGRESS_RPC";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "INGRESS_RPC_LOG";

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity of this instance. A random id is generated when absent.
    pub node_id: Option<String>,
    /// RPC timing and grouping.
    pub rpc: RpcConfig,
    /// Message bus selection.
    pub messaging: MessagingConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            rpc: RpcConfig {
                request_timeout_ms: 200,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Configured node id, or a freshly generated one.
    pub fn node_id(&self) -> NodeId {
        match &self.node_id {
            Some(id) if !id.is_empty() => NodeId::new(id.clone()),
            _ => NodeId::generate(),
        }
    }
}
