// Peer provider abstraction
// A provider owns the registry of known peer urls and keeps it populated,
// either from static configuration or from multicast heartbeats

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use cachemesh_common::{CacheMeshError, Result};

use crate::model::Configuration;

use super::multicast::{MulticastConfig, MulticastPeerProvider};
use super::peer_registry::PeerRegistry;

/// Urls advertised by this node, one per locally replicated cache
pub trait AdvertisedPeers: Send + Sync {
    fn advertised_urls(&self) -> Vec<String>;
}

impl AdvertisedPeers for Vec<String> {
    fn advertised_urls(&self) -> Vec<String> {
        self.clone()
    }
}

impl AdvertisedPeers for parking_lot::RwLock<Vec<String>> {
    fn advertised_urls(&self) -> Vec<String> {
        self.read().clone()
    }
}

/// Source of peer urls for replication
#[async_trait]
pub trait PeerProvider: Send + Sync {
    /// Start discovery. Manual providers have nothing to start.
    async fn start(&self) -> Result<()>;

    /// Stop discovery and release any sockets
    async fn stop(&self);

    fn register_peer(&self, url: &str);

    fn unregister_peer(&self, url: &str);

    /// Shared registry the resolver reads from
    fn registry(&self) -> Arc<PeerRegistry>;

    /// Snapshot of the live peer urls
    fn registered_urls(&self) -> Vec<String> {
        self.registry().list()
    }

    /// How long a new node should wait before the peer list is meaningful
    fn time_for_cluster_to_form(&self) -> Duration;

    /// Transport scheme of the urls this provider hands out
    fn scheme(&self) -> &'static str {
        "TCP"
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PeerDiscovery {
    /// Multicast heartbeat discovery
    #[default]
    Automatic,
    /// Fixed list of peer urls
    Manual,
}

impl FromStr for PeerDiscovery {
    type Err = CacheMeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "automatic" => Ok(PeerDiscovery::Automatic),
            "manual" => Ok(PeerDiscovery::Manual),
            other => Err(CacheMeshError::Config(format!(
                "peer discovery must be 'automatic' or 'manual', got '{}'",
                other
            ))),
        }
    }
}

/// Provider backed by a fixed list of peer urls
pub struct ManualPeerProvider {
    registry: Arc<PeerRegistry>,
}

impl ManualPeerProvider {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(PeerRegistry::new()),
        }
    }

    pub fn with_urls<S: AsRef<str>>(urls: &[S]) -> Self {
        let provider = Self::new();
        for url in urls {
            provider.register_peer(url.as_ref());
        }
        provider
    }
}

impl Default for ManualPeerProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerProvider for ManualPeerProvider {
    async fn start(&self) -> Result<()> {
        info!(
            "Manual peer provider started with {} peers",
            self.registry.len()
        );
        Ok(())
    }

    async fn stop(&self) {}

    fn register_peer(&self, url: &str) {
        if self.registry.register(url) {
            info!("Registered peer: {}", url);
        }
    }

    fn unregister_peer(&self, url: &str) {
        if self.registry.unregister(url) {
            info!("Unregistered peer: {}", url);
        }
    }

    fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    fn time_for_cluster_to_form(&self) -> Duration {
        Duration::ZERO
    }
}

/// Create a peer provider from configuration
pub fn create_peer_provider(
    configuration: &Configuration,
    advertised: Arc<dyn AdvertisedPeers>,
) -> Result<Arc<dyn PeerProvider>> {
    let discovery = configuration.peer_discovery().parse::<PeerDiscovery>()?;

    match discovery {
        PeerDiscovery::Manual => {
            let urls = configuration.peer_urls();
            if urls.is_empty() {
                warn!(
                    "Starting manual peer provider with empty list of peers. \
                     No replication will occur unless peers are added."
                );
            }
            info!("Using manual peer discovery");
            Ok(Arc::new(ManualPeerProvider::with_urls(&urls)))
        }
        PeerDiscovery::Automatic => {
            let config = MulticastConfig::from_configuration(configuration)?;
            info!(
                "Using multicast peer discovery on {}:{}",
                config.group_address, config.group_port
            );
            Ok(Arc::new(MulticastPeerProvider::new(config, advertised)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configuration(pairs: &[(&str, &str)]) -> Configuration {
        let mut builder = config::Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(*key, *value).unwrap();
        }
        Configuration::from_config(builder.build().unwrap())
    }

    #[test]
    fn test_parse_discovery() {
        assert_eq!("manual".parse::<PeerDiscovery>().unwrap(), PeerDiscovery::Manual);
        assert_eq!(
            " Automatic ".parse::<PeerDiscovery>().unwrap(),
            PeerDiscovery::Automatic
        );
        assert!(matches!(
            "gossip".parse::<PeerDiscovery>(),
            Err(CacheMeshError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_register_unregister() {
        let provider = ManualPeerProvider::new();
        provider.start().await.unwrap();

        provider.register_peer("tcp://localhost:40001/sampleCache1");
        provider.register_peer("tcp://localhost:40001/sampleCache1");
        assert_eq!(provider.registered_urls().len(), 1);

        provider.unregister_peer("tcp://localhost:40001/sampleCache1");
        assert!(provider.registered_urls().is_empty());

        assert_eq!(provider.time_for_cluster_to_form(), Duration::ZERO);
        assert_eq!(provider.scheme(), "TCP");
        provider.stop().await;
    }

    #[test]
    fn test_create_manual_provider_from_configuration() {
        let configuration = configuration(&[
            ("cachemesh.peer.discovery", "manual"),
            (
                "cachemesh.peer.urls",
                "tcp://a:40001/c1|tcp://b:40001/c1",
            ),
        ]);

        let provider = create_peer_provider(&configuration, Arc::new(Vec::<String>::new())).unwrap();
        assert_eq!(
            provider.registered_urls(),
            vec!["tcp://a:40001/c1", "tcp://b:40001/c1"]
        );
    }

    #[test]
    fn test_create_rejects_unknown_discovery() {
        let configuration = configuration(&[("cachemesh.peer.discovery", "dns")]);
        assert!(create_peer_provider(&configuration, Arc::new(Vec::<String>::new())).is_err());
    }

    #[test]
    fn test_create_multicast_requires_group() {
        let configuration = configuration(&[("cachemesh.peer.discovery", "automatic")]);
        assert!(matches!(
            create_peer_provider(&configuration, Arc::new(Vec::<String>::new())),
            Err(CacheMeshError::Config(_))
        ));
    }
}
