use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::FileFormat;
use serde::{Deserialize, Serialize};

use crate::router::RouterConfig;

pub const ENV_PREFIX: &str = "SIGNER";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub signing: SigningConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServiceConfig {
    #[serde(default)]
    pub json_logs: bool,

    /// Serves Prometheus metrics on `GET /metrics` when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_host: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    pub host: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct UpstreamConfig {
    pub url: String,

    #[serde(with = "humantime_serde", default = "default::upstream_timeout")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SigningConfig {
    /// Directory of per identity metadata files
    pub directory: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
}

impl SigningConfig {
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            chain_id: self.chain_id,
        }
    }
}

mod default {
    use std::time::Duration;

    pub fn upstream_timeout() -> Duration {
        Duration::from_secs(30)
    }
}

/// Layers the given TOML files in order, then `SIGNER__` prefixed
/// environment variables on top (`SIGNER__UPSTREAM__URL=...`)
pub fn load_config<'a>(
    config_files: impl Iterator<Item = &'a Path>,
) -> eyre::Result<Config> {
    let mut settings = config::Config::builder();

    for config_file in config_files {
        settings = settings.add_source(
            config::File::from(config_file).format(FileFormat::Toml),
        );
    }

    let settings = settings
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config = settings.try_deserialize::<Config>()?;

    Ok(config)
}
