//! Server startup: logging, metrics export and shutdown signalling

mod logging;
mod shutdown;

use std::net::{Ipv4Addr, SocketAddr};

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
pub use shutdown::{ShutdownSignal, run_with_shutdown, wait_for_shutdown_signal};

/// Serve the Prometheus scrape endpoint on all interfaces, then describe the metrics
pub fn init_metrics_exporter(port: u16) -> anyhow::Result<()> {
    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to start metrics exporter on {}: {}", address, e))?;
    cachemesh_core::metrics::init_metrics();
    info!("Prometheus metrics exported on {}", address);
    Ok(())
}
