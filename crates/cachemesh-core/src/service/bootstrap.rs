// Bootstrap cache loader
// Primes a newly joined cache by copying the contents of one random peer,
// fetching elements in chunks bounded by an estimated byte size

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cachemesh_common::Result;

use crate::model::Configuration;

use super::remote::MAX_FRAME_BYTES;
use super::resolver::{CachePeer, PeerResolver};
use super::store::CacheStore;

pub const DEFAULT_MAXIMUM_CHUNK_SIZE_BYTES: usize = 5_000_000;
const FIVE_KB: i64 = 5_000;
const ONE_HUNDRED_MB: i64 = 100_000_000;

/// Bytes one chunk response may carry, leaving room for frame overhead and
/// elements larger than the sampled one
pub const MAXIMUM_CHUNK_BUDGET_BYTES: usize = MAX_FRAME_BYTES as usize / 2;

#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    /// Load in the background instead of blocking cache creation
    pub asynchronously: bool,
    pub maximum_chunk_size_bytes: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            asynchronously: true,
            maximum_chunk_size_bytes: DEFAULT_MAXIMUM_CHUNK_SIZE_BYTES,
        }
    }
}

impl BootstrapConfig {
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            asynchronously: configuration.bootstrap_asynchronously(),
            maximum_chunk_size_bytes: Self::chunk_size_from(
                configuration.bootstrap_maximum_chunk_size_bytes(),
            ),
        }
    }

    /// Chunk sizes outside 5KB..=100MB fall back to the default
    pub fn chunk_size_from(bytes: i64) -> usize {
        if (FIVE_KB..=ONE_HUNDRED_MB).contains(&bytes) {
            bytes as usize
        } else {
            warn!(
                "Trying to set the chunk size to an unreasonable number {}. \
                 Using the default of {} instead.",
                bytes, DEFAULT_MAXIMUM_CHUNK_SIZE_BYTES
            );
            DEFAULT_MAXIMUM_CHUNK_SIZE_BYTES
        }
    }

    /// Configured chunk size, capped so a chunk response fits in one frame
    pub fn chunk_budget_bytes(&self) -> usize {
        self.maximum_chunk_size_bytes.min(MAXIMUM_CHUNK_BUDGET_BYTES)
    }
}

#[derive(Clone)]
pub struct BootstrapCacheLoader {
    config: BootstrapConfig,
    resolver: Arc<PeerResolver>,
    startup_delay: Duration,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BootstrapCacheLoader {
    pub fn new(config: BootstrapConfig, resolver: Arc<PeerResolver>) -> Self {
        Self {
            config,
            resolver,
            startup_delay: Duration::ZERO,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Wait before loading so discovery has time to find peers
    pub fn with_startup_delay(mut self, startup_delay: Duration) -> Self {
        self.startup_delay = startup_delay;
        self
    }

    pub fn is_asynchronous(&self) -> bool {
        self.config.asynchronously
    }

    /// Load the store from a peer, in the background when configured so.
    ///
    /// Returns the number of elements loaded, or 0 when loading was handed off.
    pub async fn load(&self, store: Arc<dyn CacheStore>) -> Result<usize> {
        if self.config.asynchronously {
            let loader = self.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = loader.load_now(store.clone()).await {
                    warn!("Bootstrap of cache {} failed: {}", store.name(), e);
                }
            });
            let mut tasks = self.tasks.lock();
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
            return Ok(0);
        }
        self.load_now(store).await
    }

    /// Background loads that have not finished yet
    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Cancel background loads and wait for them to stop
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        debug!("Cancelling {} bootstrap task(s)", tasks.len());
        for task in &tasks {
            task.abort();
        }
        join_all(tasks).await;
    }

    pub async fn load_now(&self, store: Arc<dyn CacheStore>) -> Result<usize> {
        if !self.startup_delay.is_zero() {
            tokio::time::sleep(self.startup_delay).await;
        }

        let peers = self.resolver.list_peers_for_cache(store.name()).await;
        if peers.is_empty() {
            debug!(
                "Empty list of cache peers for cache {}. No cache peer to bootstrap from.",
                store.name()
            );
            return Ok(0);
        }

        let peer = &peers[rand::rng().random_range(0..peers.len())];
        info!("Bootstrapping {} from {}", store.name(), peer.url());

        let keys = peer.keys().await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let sample_size = peer
            .get_elements(&keys[..1])
            .await?
            .first()
            .map(|element| element.serialized_size())
            .unwrap_or(1)
            .max(1);
        let keys_per_chunk = (self.config.chunk_budget_bytes() / sample_size).max(1);
        debug!(
            "Bootstrapping {} keys in chunks of {} (sample element is {} bytes)",
            keys.len(),
            keys_per_chunk,
            sample_size
        );

        let loaded =
            Self::copy_chunks(peer.as_ref(), &keys, keys_per_chunk, store.as_ref()).await?;

        info!(
            "Bootstrap of {} from {} completed: {} elements loaded",
            store.name(),
            peer.url(),
            loaded
        );
        Ok(loaded)
    }

    /// Copy the keys chunk by chunk. A chunk the peer fails to return is split
    /// in half and retried; a single key that still fails aborts the load.
    async fn copy_chunks(
        peer: &dyn CachePeer,
        keys: &[String],
        keys_per_chunk: usize,
        store: &dyn CacheStore,
    ) -> Result<usize> {
        let mut pending: Vec<&[String]> = keys.chunks(keys_per_chunk).rev().collect();
        let mut loaded = 0;
        while let Some(chunk) = pending.pop() {
            match peer.get_elements(chunk).await {
                Ok(elements) => {
                    for element in elements {
                        store.put_quiet(element);
                        loaded += 1;
                    }
                }
                Err(e) if chunk.len() > 1 => {
                    debug!(
                        "Chunk of {} keys from {} failed ({}), retrying in halves",
                        chunk.len(),
                        peer.url(),
                        e
                    );
                    let (head, tail) = chunk.split_at(chunk.len() / 2);
                    pending.push(tail);
                    pending.push(head);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use cachemesh_common::CacheMeshError;

    use super::*;
    use crate::model::{Element, EventMessage};
    use crate::service::peer_registry::PeerRegistry;
    use crate::service::resolver::PeerConnector;
    use crate::service::store::MemoryCacheStore;

    const PEER_URL: &str = "tcp://10.0.0.1:40001/c1";

    /// Serves elements but refuses any response larger than `response_limit`
    struct LimitedPeer {
        elements: Vec<Element>,
        response_limit: usize,
        requests: Mutex<Vec<usize>>,
    }

    impl LimitedPeer {
        fn new(elements: Vec<Element>, response_limit: usize) -> Self {
            Self {
                elements,
                response_limit,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CachePeer for LimitedPeer {
        fn url(&self) -> &str {
            PEER_URL
        }

        async fn put(&self, _element: Element) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }

        async fn remove_all(&self) -> Result<()> {
            Ok(())
        }

        async fn send(&self, _messages: Vec<EventMessage>) -> Result<()> {
            Ok(())
        }

        async fn keys(&self) -> Result<Vec<String>> {
            Ok(self.elements.iter().map(|e| e.key.clone()).collect())
        }

        async fn get_elements(&self, keys: &[String]) -> Result<Vec<Element>> {
            self.requests.lock().push(keys.len());
            let found: Vec<Element> = self
                .elements
                .iter()
                .filter(|e| keys.contains(&e.key))
                .cloned()
                .collect();
            let size: usize = found.iter().map(Element::serialized_size).sum();
            if size > self.response_limit {
                return Err(CacheMeshError::RemoteCommunication(format!(
                    "response of {} bytes exceeds limit",
                    size
                )));
            }
            Ok(found)
        }
    }

    struct SharedConnector {
        peer: Arc<LimitedPeer>,
        delay: Duration,
        connected: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PeerConnector for SharedConnector {
        async fn connect(&self, _url: &str) -> Result<Arc<dyn CachePeer>> {
            tokio::time::sleep(self.delay).await;
            self.connected.store(true, Ordering::SeqCst);
            Ok(self.peer.clone())
        }
    }

    fn loader(
        config: BootstrapConfig,
        peer: Arc<LimitedPeer>,
        delay: Duration,
    ) -> (BootstrapCacheLoader, Arc<AtomicBool>) {
        let registry = Arc::new(PeerRegistry::new());
        registry.register(PEER_URL);
        let connected = Arc::new(AtomicBool::new(false));
        let connector = SharedConnector {
            peer,
            delay,
            connected: connected.clone(),
        };
        let resolver = Arc::new(PeerResolver::new(registry, Arc::new(connector)));
        (BootstrapCacheLoader::new(config, resolver), connected)
    }

    fn synchronous(maximum_chunk_size_bytes: usize) -> BootstrapConfig {
        BootstrapConfig {
            asynchronously: false,
            maximum_chunk_size_bytes,
        }
    }

    #[test]
    fn test_chunk_size_range() {
        assert_eq!(BootstrapConfig::chunk_size_from(5_000), 5_000);
        assert_eq!(BootstrapConfig::chunk_size_from(100_000_000), 100_000_000);
        assert_eq!(
            BootstrapConfig::chunk_size_from(4_999),
            DEFAULT_MAXIMUM_CHUNK_SIZE_BYTES
        );
        assert_eq!(
            BootstrapConfig::chunk_size_from(100_000_001),
            DEFAULT_MAXIMUM_CHUNK_SIZE_BYTES
        );
    }

    #[test]
    fn test_chunk_budget_fits_in_one_frame() {
        let large = synchronous(BootstrapConfig::chunk_size_from(100_000_000));
        assert_eq!(large.chunk_budget_bytes(), MAXIMUM_CHUNK_BUDGET_BYTES);
        assert!(large.chunk_budget_bytes() < MAX_FRAME_BYTES as usize);

        assert_eq!(synchronous(5_000).chunk_budget_bytes(), 5_000);
        assert_eq!(
            BootstrapConfig::default().chunk_budget_bytes(),
            DEFAULT_MAXIMUM_CHUNK_SIZE_BYTES
        );
    }

    #[test]
    fn test_from_configuration_defaults() {
        let config = BootstrapConfig::from_configuration(&Configuration::default());
        assert!(config.asynchronously);
        assert_eq!(config.maximum_chunk_size_bytes, DEFAULT_MAXIMUM_CHUNK_SIZE_BYTES);
    }

    #[tokio::test]
    async fn test_failed_chunk_is_split_and_retried() {
        // The sampled first element is tiny, so the first chunk asks for everything
        let mut elements = vec![Element::new("k00", vec![1u8; 4])];
        for i in 1..20 {
            elements.push(Element::new(format!("k{:02}", i), vec![255u8; 2_000]));
        }
        let limit = elements[1].serialized_size() * 3;
        let peer = Arc::new(LimitedPeer::new(elements, limit));
        let (loader, _) = loader(synchronous(100_000_000), peer.clone(), Duration::ZERO);

        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new("c1"));
        let loaded = loader.load(store.clone()).await.unwrap();

        assert_eq!(loaded, 20);
        assert_eq!(store.size(), 20);
        assert_eq!(store.get_quiet("k19").unwrap().value.len(), 2_000);
        let requests = peer.requests.lock().clone();
        // sample request, then the full chunk which fails and gets split
        assert_eq!(&requests[..2], &[1, 20]);
        assert!(requests.iter().skip(2).all(|n| *n < 20));
    }

    #[tokio::test]
    async fn test_element_larger_than_any_response_fails_load() {
        let elements = vec![
            Element::new("small", vec![1u8; 4]),
            Element::new("huge", vec![255u8; 10_000]),
        ];
        let limit = elements[0].serialized_size() * 4;
        let peer = Arc::new(LimitedPeer::new(elements, limit));
        let (loader, _) = loader(synchronous(100_000), peer, Duration::ZERO);

        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new("c1"));
        let result = loader.load(store).await;
        assert!(matches!(
            result,
            Err(CacheMeshError::RemoteCommunication(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_background_load() {
        let peer = Arc::new(LimitedPeer::new(
            vec![Element::new("k", b"v".to_vec())],
            usize::MAX,
        ));
        let config = BootstrapConfig {
            asynchronously: true,
            ..BootstrapConfig::default()
        };
        let (loader, connected) = loader(config, peer, Duration::from_millis(300));

        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new("c1"));
        assert_eq!(loader.load(store.clone()).await.unwrap(), 0);
        assert_eq!(loader.pending(), 1);

        loader.shutdown().await;
        assert_eq!(loader.pending(), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!connected.load(Ordering::SeqCst));
        assert_eq!(store.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_load_completes_without_shutdown() {
        let peer = Arc::new(LimitedPeer::new(
            vec![Element::new("k", b"v".to_vec())],
            usize::MAX,
        ));
        let config = BootstrapConfig {
            asynchronously: true,
            ..BootstrapConfig::default()
        };
        let (loader, connected) = loader(config, peer, Duration::from_millis(300));

        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new("c1"));
        loader.load(store.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(connected.load(Ordering::SeqCst));
        assert_eq!(store.size(), 1);
        assert_eq!(loader.pending(), 0);
    }
}
