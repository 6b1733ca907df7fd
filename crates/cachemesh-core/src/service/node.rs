// Node orchestration
// Wires the listener, peer provider, resolver, dispatcher and bootstrap loader
// into one node and exposes replicated caches to the host application

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

use cachemesh_common::{CacheMeshError, Result};

use crate::model::{Configuration, Element, MutationEvent};

use super::bootstrap::{BootstrapCacheLoader, BootstrapConfig};
use super::payload::URL_DELIMITER;
use super::peer_provider::{PeerProvider, create_peer_provider};
use super::peer_registry::PeerRegistry;
use super::remote::{PeerListener, TcpPeerConnector};
use super::replicator::{ReplicationDispatcher, ReplicatorConfig};
use super::resolver::{PeerConnector, PeerResolver};
use super::store::{CacheStore, MemoryCacheStore};

/// A local cache whose mutations are replicated to its peers.
///
/// The local write always completes before replication is attempted, and
/// replication failures never surface here.
pub struct ReplicatedCache {
    store: Arc<dyn CacheStore>,
    dispatcher: Arc<ReplicationDispatcher>,
}

impl ReplicatedCache {
    pub fn new(store: Arc<dyn CacheStore>, dispatcher: Arc<ReplicationDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    pub fn get(&self, key: &str) -> Option<Element> {
        self.store.get_quiet(key)
    }

    pub async fn put(&self, element: Element) {
        let existed = self.store.get_quiet(&element.key).is_some();
        self.store.put_quiet(element.clone());

        let event = if existed {
            MutationEvent::update(self.name(), element)
        } else {
            MutationEvent::put(self.name(), element)
        };
        self.dispatcher.notify(event).await;
    }

    /// Returns whether the key was present
    pub async fn remove(&self, key: &str) -> bool {
        let removed = self.store.remove_quiet(key);
        if removed {
            self.dispatcher
                .notify(MutationEvent::remove(self.name(), key))
                .await;
        }
        removed
    }

    pub async fn remove_all(&self) {
        self.store.remove_all_quiet();
        self.dispatcher
            .notify(MutationEvent::remove_all(self.name()))
            .await;
    }

    pub fn size(&self) -> usize {
        self.store.size()
    }

    pub fn keys(&self) -> Vec<String> {
        self.store.keys()
    }

    pub fn store(&self) -> Arc<dyn CacheStore> {
        self.store.clone()
    }
}

/// One member of a cachemesh cluster
pub struct CacheMeshNode {
    listener: Arc<PeerListener>,
    provider: Arc<dyn PeerProvider>,
    resolver: Arc<PeerResolver>,
    dispatcher: Arc<ReplicationDispatcher>,
    bootstrap: Option<BootstrapCacheLoader>,
    caches: DashMap<String, Arc<ReplicatedCache>>,
    running: RwLock<bool>,
}

impl CacheMeshNode {
    /// Build a node using the TCP transport
    pub fn new(configuration: &Configuration) -> Result<Self> {
        let connector = Arc::new(TcpPeerConnector::new(configuration.socket_timeout()));
        Self::with_connector(configuration, connector)
    }

    pub fn with_connector(
        configuration: &Configuration,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Self> {
        let listener = Arc::new(PeerListener::from_configuration(configuration));
        let provider = create_peer_provider(configuration, listener.clone())?;

        let resolver = Arc::new(
            PeerResolver::new(provider.registry(), connector)
                .with_local_peers(listener.clone())
                .with_lookup_timeout(configuration.socket_timeout()),
        );
        let dispatcher = Arc::new(ReplicationDispatcher::new(
            ReplicatorConfig::from_configuration(configuration),
            resolver.clone(),
        ));

        let bootstrap = configuration.bootstrap_enabled().then(|| {
            BootstrapCacheLoader::new(
                BootstrapConfig::from_configuration(configuration),
                resolver.clone(),
            )
            .with_startup_delay(provider.time_for_cluster_to_form())
        });

        Ok(Self {
            listener,
            provider,
            resolver,
            dispatcher,
            bootstrap,
            caches: DashMap::new(),
            running: RwLock::new(false),
        })
    }

    /// Start serving peers, then start discovery
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }

        let address = self.listener.start().await?;
        if let Err(e) = self.provider.start().await {
            self.listener.stop();
            return Err(e);
        }

        *running = true;
        info!(
            "cachemesh node started on {} with {} known peers",
            address,
            self.provider.registered_urls().len()
        );
        Ok(())
    }

    /// Cancel bootstrap loads, stop discovery, drain replication queues, then
    /// close the listener
    pub async fn shutdown(&self) {
        let mut running = self.running.write().await;
        if let Some(bootstrap) = &self.bootstrap {
            bootstrap.shutdown().await;
        }
        if !*running {
            return;
        }

        self.provider.stop().await;
        self.dispatcher.shutdown().await;
        self.listener.stop();

        *running = false;
        info!("cachemesh node stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Create, or return the existing, replicated cache with this name
    pub async fn add_cache(&self, name: &str) -> Result<Arc<ReplicatedCache>> {
        if name.is_empty() || name.contains(URL_DELIMITER) || name.contains('/') {
            return Err(CacheMeshError::Config(format!(
                "invalid cache name '{}': must be non-empty without '{}' or '/'",
                name, URL_DELIMITER
            )));
        }

        if let Some(cache) = self.caches.get(name) {
            return Ok(cache.value().clone());
        }

        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new(name));
        let cache = Arc::new(ReplicatedCache::new(store.clone(), self.dispatcher.clone()));
        self.caches.insert(name.to_string(), cache.clone());
        self.listener.register_cache(store.clone());
        info!("Added replicated cache {}", name);

        if let Some(bootstrap) = &self.bootstrap
            && let Err(e) = bootstrap.load(store).await
        {
            warn!("Bootstrap of cache {} failed: {}", name, e);
        }

        Ok(cache)
    }

    pub fn cache(&self, name: &str) -> Option<Arc<ReplicatedCache>> {
        self.caches.get(name).map(|cache| cache.value().clone())
    }

    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    pub fn listener(&self) -> &Arc<PeerListener> {
        &self.listener
    }

    pub fn provider(&self) -> &Arc<dyn PeerProvider> {
        &self.provider
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.provider.registry()
    }

    pub fn resolver(&self) -> &Arc<PeerResolver> {
        &self.resolver
    }

    pub fn dispatcher(&self) -> &Arc<ReplicationDispatcher> {
        &self.dispatcher
    }
}
