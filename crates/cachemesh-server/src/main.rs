//! Main entry point for the cachemesh server.
//!
//! Starts one node, hosts the configured caches and replicates them to the
//! peers found through manual or multicast discovery until signalled.

use std::time::Duration;

use tracing::{error, info, warn};

use cachemesh_core::CacheMeshNode;
use cachemesh_server::{model::ServerConfiguration, startup};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let configuration = ServerConfiguration::new()?;
    let _logging_guard = startup::init_logging(&configuration.logging_config())?;

    match configuration.metrics_port() {
        Some(port) => startup::init_metrics_exporter(port)?,
        None => cachemesh_core::metrics::init_metrics(),
    }

    let node = CacheMeshNode::new(configuration.core())?;
    node.start().await?;

    let shutdown_signal = startup::wait_for_shutdown_signal().await;

    let caches = configuration.caches();
    if caches.is_empty() {
        warn!("No caches configured, this node only takes part in discovery");
    }
    match startup::run_with_shutdown(host_caches(&node, caches), &shutdown_signal).await {
        Some(Ok(())) => {
            info!(
                "cachemesh server ready, hosting {:?} with {} known peers",
                node.cache_names(),
                node.registry().len()
            );
            shutdown_signal.wait().await;
        }
        Some(Err(e)) => {
            error!("Failed to host caches: {}", e);
            stop_node(&node, configuration.shutdown_timeout()).await;
            return Err(e);
        }
        None => {}
    }

    stop_node(&node, configuration.shutdown_timeout()).await;

    Ok(())
}

async fn host_caches(node: &CacheMeshNode, caches: Vec<String>) -> anyhow::Result<()> {
    for name in caches {
        node.add_cache(&name).await?;
    }
    Ok(())
}

async fn stop_node(node: &CacheMeshNode, timeout: Duration) {
    info!("Stopping cachemesh node, waiting up to {:?}", timeout);
    if tokio::time::timeout(timeout, node.shutdown()).await.is_err() {
        warn!("cachemesh node did not stop within {:?}", timeout);
    }
    info!("Shutdown complete");
}
