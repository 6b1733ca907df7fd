//! Configuration loading for the cachemesh server
//!
//! Sources are layered as file, then `CACHEMESH__*` environment, then
//! command line flags. The merged result is handed to the core crate.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment};

use cachemesh_core::Configuration;

use crate::startup::LoggingConfig;

pub const DEFAULT_CONFIG_FILE: &str = "conf/cachemesh.yml";
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: i64 = 30_000;

/// Command line arguments for the server
#[derive(Debug, Parser)]
#[command(name = "cachemesh-server", version, about)]
pub struct Cli {
    /// Configuration file, missing files are ignored
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    /// Port the peer listener binds
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,
    /// Peer discovery strategy: automatic or manual
    #[arg(short = 'd', long = "discovery")]
    pub discovery: Option<String>,
    /// '|' separated peer URLs for manual discovery
    #[arg(long = "peers")]
    pub peers: Option<String>,
    /// Multicast group as address:port for automatic discovery
    #[arg(long = "multicast-group")]
    pub multicast_group: Option<String>,
    /// ',' separated names of the caches this node hosts
    #[arg(long = "caches")]
    pub caches: Option<String>,
    #[arg(long = "metrics-port")]
    pub metrics_port: Option<u16>,
}

/// Server configuration: the core settings plus the server-only keys
#[derive(Clone, Debug, Default)]
pub struct ServerConfiguration {
    core: Configuration,
}

impl ServerConfiguration {
    pub fn new() -> anyhow::Result<Self> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(args: Cli) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(config::File::from(args.config.clone()).required(false))
            .add_source(
                Environment::with_prefix("CACHEMESH")
                    .separator("__")
                    .keep_prefix(true)
                    .try_parsing(true),
            );

        if let Some(v) = args.port {
            builder = builder.set_override("cachemesh.listener.port", i64::from(v))?;
        }
        if let Some(v) = args.discovery {
            builder = builder.set_override("cachemesh.peer.discovery", v)?;
        }
        if let Some(v) = args.peers {
            builder = builder.set_override("cachemesh.peer.urls", v)?;
        }
        if let Some(v) = args.multicast_group {
            let (address, port) = v.rsplit_once(':').ok_or_else(|| {
                anyhow::anyhow!("--multicast-group must be address:port, got '{}'", v)
            })?;
            builder = builder
                .set_override("cachemesh.multicast.group.address", address)?
                .set_override("cachemesh.multicast.group.port", port)?;
        }
        if let Some(v) = args.caches {
            builder = builder.set_override("cachemesh.caches", v)?;
        }
        if let Some(v) = args.metrics_port {
            builder = builder.set_override("cachemesh.metrics.port", i64::from(v))?;
        }

        let config = builder.build().map_err(|e| {
            anyhow::anyhow!(
                "Failed to build configuration from {}: {}",
                args.config.display(),
                e
            )
        })?;

        Ok(Self {
            core: Configuration::from_config(config),
        })
    }

    pub fn core(&self) -> &Configuration {
        &self.core
    }

    pub fn caches(&self) -> Vec<String> {
        self.core.caches()
    }

    pub fn metrics_port(&self) -> Option<u16> {
        self.core.metrics_port()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        let millis = self
            .core
            .config
            .get_int("cachemesh.shutdown.timeout.ms")
            .ok()
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS);
        Duration::from_millis(millis as u64)
    }

    // ========================================================================
    // Logging Configuration
    // ========================================================================

    /// Logging settings from `cachemesh.log.*`, then `CACHEMESH_LOG_*` overrides
    pub fn logging_config(&self) -> LoggingConfig {
        let config = &self.core.config;
        LoggingConfig::from_config(
            config.get_string("cachemesh.log.path").ok(),
            config.get_bool("cachemesh.log.console").unwrap_or(true),
            config.get_bool("cachemesh.log.file").unwrap_or(true),
            config
                .get_string("cachemesh.log.level")
                .unwrap_or("info".to_string()),
        )
        .with_env_overrides()
    }
}
