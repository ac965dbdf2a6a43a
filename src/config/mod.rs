//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod exchange;
mod messaging;

pub use exchange::{AgentConfig, DeliveryMode, ExchangeConfig, ListenerConfig};
pub use messaging::{AmqpConfig, BrokerConfig, BrokerType};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "clique.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CLIQUE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CLIQUE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CLIQUE_LOG";

use serde::Deserialize;

use crate::envelope::PeerId;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fixed peer identity; a random one is generated when unset.
    pub identity: Option<String>,
    /// Broker configuration.
    pub broker: BrokerConfig,
    /// Listener configuration.
    pub listener: ListenerConfig,
    /// Exchange timeouts and retries.
    pub exchange: ExchangeConfig,
    /// Agent answers (agent binary only).
    pub agent: AgentConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `clique.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
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

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// The configured identity, or a fresh one.
    pub fn peer_id(&self) -> PeerId {
        match &self.identity {
            Some(id) if !id.is_empty() => PeerId::new(id.clone()),
            _ => PeerId::generate(),
        }
    }
}
