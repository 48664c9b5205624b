//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! A Redis URL may carry a password, so `REDIS_URL` in the environment
//! overrides `[governor] redis_url` and keeps it out of the TOML.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use acquisition::{EngineConfig, GovernorConfig};
use identity_pool::PoolConfig;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub admin: AdminConfig,
    pub sources: SourcesConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
}

/// Admin listener settings
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Where the pools load their resources from
#[derive(Debug, Deserialize)]
pub struct SourcesConfig {
    /// JSON file of session credentials, created empty when missing.
    pub credentials_path: PathBuf,
    /// One proxy per line. Absent means every session egresses directly.
    #[serde(default)]
    pub proxies_path: Option<PathBuf>,
}

fn default_max_connections() -> usize {
    64
}

impl Config {
    /// Load configuration from a TOML file, validate it, then overlay
    /// environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.admin.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        config.pool.validate()?;
        config.engine.validate()?;

        if let Ok(url) = std::env::var("REDIS_URL")
            && !url.trim().is_empty()
        {
            config.governor.redis_url = Some(url.trim().to_owned());
        }
        config.governor.validate()?;

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("harvestd.toml")
    }
}
