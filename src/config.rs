//! Configuration management for Quotagate.

use clap::ValueEnum;
use config::{Config, Environment, File, FileFormat, Source};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::Result;
use crate::ratelimit::PresetsConfig;

/// Environment variable conventionally holding the Redis URL.
pub const REDIS_URL_ENV: &str = "REDIS_URL";

/// Prefix for environment overrides, e.g. `QUOTAGATE__STORE__URL`.
const ENV_PREFIX: &str = "QUOTAGATE";

/// Main configuration for the Quotagate service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotagateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Named limiter presets
    #[serde(default)]
    pub limits: PresetsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

/// Which counter store backs the limiters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis server, for multi-instance deployments
    #[default]
    Redis,
    /// In-process map, for a single instance
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Bound on establishing the connection, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Bound on each get/set round trip, in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// After a failed connection attempt, calls fail immediately for this
    /// long before another attempt is made, in milliseconds
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout(),
            command_timeout_ms: default_command_timeout(),
            reconnect_backoff_ms: default_reconnect_backoff(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_command_timeout() -> u64 {
    500
}

fn default_reconnect_backoff() -> u64 {
    1000
}

impl QuotagateConfig {
    /// Load configuration from defaults, an optional YAML file and the environment.
    ///
    /// Later sources win: `QUOTAGATE__*` variables override the file, and
    /// `REDIS_URL` overrides the store URL from both.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(defaults()?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );
        if let Ok(url) = std::env::var(REDIS_URL_ENV) {
            builder = builder.set_override("store.url", url)?;
        }

        Self::finish(builder.build()?)
    }

    /// Load configuration from a YAML string layered over the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(defaults()?)
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        Self::finish(config)
    }

    fn finish(config: Config) -> Result<Self> {
        let config: QuotagateConfig = config.try_deserialize()?;
        config.limits.validate()?;
        Ok(config)
    }
}

/// The built-in defaults as a configuration source, so that any single
/// field can be overridden on its own.
fn defaults() -> Result<impl Source + Send + Sync + 'static> {
    Ok(Config::try_from(&QuotagateConfig::default())?)
}
