// Remote peer resolution
// Turns registered peer urls into live handles for a given cache

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, trace, warn};

use cachemesh_common::Result;

use crate::model::{Element, EventMessage};

use super::peer_provider::AdvertisedPeers;
use super::peer_registry::PeerRegistry;

const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to a cache on a remote node
#[async_trait]
pub trait CachePeer: Send + Sync {
    /// The url this handle was resolved from
    fn url(&self) -> &str;

    fn cache_name(&self) -> &str {
        extract_cache_name(self.url())
    }

    async fn put(&self, element: Element) -> Result<()>;

    /// Returns whether the remote cache held the key
    async fn remove(&self, key: &str) -> Result<bool>;

    async fn remove_all(&self) -> Result<()>;

    /// Apply a batch of messages in order
    async fn send(&self, messages: Vec<EventMessage>) -> Result<()>;

    async fn keys(&self) -> Result<Vec<String>>;

    /// Elements for the given keys. Keys the peer no longer holds are omitted.
    async fn get_elements(&self, keys: &[String]) -> Result<Vec<Element>>;
}

/// Transport-specific lookup of a peer url
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn CachePeer>>;
}

/// Cache name of a peer url: everything after the last `/`.
pub fn extract_cache_name(url: &str) -> &str {
    url.rsplit_once('/').map(|(_, name)| name).unwrap_or(url)
}

/// Whether a peer url refers to the given cache
pub fn is_same_cache(url: &str, cache_name: &str) -> bool {
    let same = extract_cache_name(url) == cache_name;
    if !same {
        trace!("Peer url {} is not for cache {}", url, cache_name);
    }
    same
}

pub struct PeerResolver {
    registry: Arc<PeerRegistry>,
    connector: Arc<dyn PeerConnector>,
    local_peers: Option<Arc<dyn AdvertisedPeers>>,
    lookup_timeout: Duration,
}

impl PeerResolver {
    pub fn new(registry: Arc<PeerRegistry>, connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            registry,
            connector,
            local_peers: None,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    /// Urls of this node, excluded from every peer list
    pub fn with_local_peers(mut self, local_peers: Arc<dyn AdvertisedPeers>) -> Self {
        self.local_peers = Some(local_peers);
        self
    }

    pub fn with_lookup_timeout(mut self, lookup_timeout: Duration) -> Self {
        self.lookup_timeout = lookup_timeout;
        self
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Resolve one url. Failure is logged and reported as absence.
    pub async fn resolve(&self, url: &str) -> Option<Arc<dyn CachePeer>> {
        debug!("Lookup peer url {}", url);
        match tokio::time::timeout(self.lookup_timeout, self.connector.connect(url)).await {
            Ok(Ok(peer)) => Some(peer),
            Ok(Err(e)) => {
                warn!("Unable to lookup remote cache peer for {}: {}", url, e);
                None
            }
            Err(_) => {
                warn!(
                    "Timed out after {:?} looking up remote cache peer for {}",
                    self.lookup_timeout, url
                );
                None
            }
        }
    }

    /// Resolved peers for a cache, in registry order. Unreachable urls are skipped.
    pub async fn list_peers_for_cache(&self, cache_name: &str) -> Vec<Arc<dyn CachePeer>> {
        let local = self
            .local_peers
            .as_ref()
            .map(|l| l.advertised_urls())
            .unwrap_or_default();

        let urls: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|url| is_same_cache(url, cache_name))
            .filter(|url| !local.contains(url))
            .collect();

        join_all(urls.iter().map(|url| self.resolve(url)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}
