// Replication dispatcher
// Filters local mutations by the configured flags and delivers them to every
// peer holding the same cache, either inline or through a per-cache batch queue

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use tracing::{debug, info, warn};

use cachemesh_common::Result;

use crate::metrics;
use crate::model::{
    Configuration, Element, EventMessage, MutationEvent, MutationKind, ReplicationBatch,
};

use super::batch_queue::{BatchQueue, BatchQueueConfig, BatchSink};
use super::resolver::{CachePeer, PeerResolver};

pub const DEFAULT_ASYNC_INTERVAL_MILLIS: u64 = 1000;
pub const MINIMUM_REASONABLE_INTERVAL_MILLIS: u64 = 10;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Deliver on the caller's task before returning
    Synchronous,
    /// Queue and deliver from a background flusher
    Asynchronous,
}

/// Replication configuration
#[derive(Clone, Debug)]
pub struct ReplicatorConfig {
    pub replicate_puts: bool,
    pub replicate_puts_via_copy: bool,
    pub replicate_updates: bool,
    pub replicate_updates_via_copy: bool,
    pub replicate_removals: bool,
    pub mode: ReplicationMode,
    pub async_interval: Duration,
    pub max_batch_size: usize,
    /// Longest a single remote call may take before the peer counts as unreachable
    pub call_timeout: Duration,
    /// Time queues get to drain on shutdown
    pub shutdown_grace: Duration,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            replicate_puts: true,
            replicate_puts_via_copy: true,
            replicate_updates: true,
            replicate_updates_via_copy: true,
            replicate_removals: true,
            mode: ReplicationMode::Asynchronous,
            async_interval: Duration::from_millis(DEFAULT_ASYNC_INTERVAL_MILLIS),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            call_timeout: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

impl ReplicatorConfig {
    pub fn from_configuration(configuration: &Configuration) -> Self {
        let mode = if configuration.replicate_asynchronously() {
            ReplicationMode::Asynchronous
        } else {
            ReplicationMode::Synchronous
        };

        let max_batch_size = match configuration.async_max_batch_size() {
            size if size > 0 => size as usize,
            size => {
                warn!(
                    "Maximum batch size {} is not positive. Using the default {} instead.",
                    size, DEFAULT_MAX_BATCH_SIZE
                );
                DEFAULT_MAX_BATCH_SIZE
            }
        };

        Self {
            replicate_puts: configuration.replicate_puts(),
            replicate_puts_via_copy: configuration.replicate_puts_via_copy(),
            replicate_updates: configuration.replicate_updates(),
            replicate_updates_via_copy: configuration.replicate_updates_via_copy(),
            replicate_removals: configuration.replicate_removals(),
            mode,
            async_interval: Self::interval_from_millis(
                configuration.async_replication_interval_ms(),
            ),
            max_batch_size,
            call_timeout: configuration.socket_timeout(),
            shutdown_grace: configuration.replication_shutdown_grace(),
        }
    }

    /// Interval below the floor is replaced by the default
    pub fn interval_from_millis(millis: i64) -> Duration {
        if millis < MINIMUM_REASONABLE_INTERVAL_MILLIS as i64 {
            warn!(
                "Trying to set the asynchronous replication interval to an unreasonable \
                 number of {}ms. Using the default of {}ms instead.",
                millis, DEFAULT_ASYNC_INTERVAL_MILLIS
            );
            return Duration::from_millis(DEFAULT_ASYNC_INTERVAL_MILLIS);
        }
        Duration::from_millis(millis as u64)
    }

    pub fn synchronous() -> Self {
        Self {
            mode: ReplicationMode::Synchronous,
            ..Self::default()
        }
    }

    pub fn asynchronous(interval: Duration, max_batch_size: usize) -> Self {
        Self {
            mode: ReplicationMode::Asynchronous,
            async_interval: interval,
            max_batch_size,
            ..Self::default()
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Whether any mutation kind is replicated at all
    pub fn replicates_anything(&self) -> bool {
        self.replicate_puts || self.replicate_updates || self.replicate_removals
    }

    /// Apply the per-kind flags. Returns None for events that are not replicated.
    pub fn accept(&self, event: MutationEvent) -> Option<MutationEvent> {
        match event.kind {
            MutationKind::Put if self.replicate_puts => {
                Some(event.with_via_copy(self.replicate_puts_via_copy))
            }
            MutationKind::Update if self.replicate_updates => {
                Some(event.with_via_copy(self.replicate_updates_via_copy))
            }
            MutationKind::Remove if self.replicate_removals => Some(event),
            MutationKind::RemoveAll if self.replicates_anything() => Some(event),
            _ => None,
        }
    }
}

/// Dispatches local mutations to peers
pub struct ReplicationDispatcher {
    config: ReplicatorConfig,
    resolver: Arc<PeerResolver>,
    queues: DashMap<String, Arc<BatchQueue>>,
    alive: AtomicBool,
}

impl ReplicationDispatcher {
    pub fn new(config: ReplicatorConfig, resolver: Arc<PeerResolver>) -> Self {
        info!("Replication dispatcher created in {:?} mode", config.mode);
        Self {
            config,
            resolver,
            queues: DashMap::new(),
            alive: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn mode(&self) -> ReplicationMode {
        self.config.mode
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Replicate a local mutation.
    ///
    /// Never fails: peer errors are logged and counted. In asynchronous mode
    /// this only enqueues.
    pub async fn notify(&self, event: MutationEvent) {
        if !self.is_alive() {
            debug!(
                "Dispatcher is shut down, not replicating {} on {}",
                event.kind, event.cache_name
            );
            return;
        }

        let Some(event) = self.config.accept(event) else {
            return;
        };
        metrics::record_replication_event(&event.cache_name, &event.kind.to_string());

        match self.config.mode {
            ReplicationMode::Asynchronous => match self.queue_for(&event.cache_name) {
                Some(queue) => {
                    queue.push(event);
                }
                None => debug!(
                    "Dispatcher shut down while queueing {} on {}",
                    event.kind, event.cache_name
                ),
            },
            ReplicationMode::Synchronous => self.replicate_now(event).await,
        }
    }

    pub async fn notify_element_put(&self, cache_name: &str, element: Element) {
        self.notify(MutationEvent::put(cache_name, element)).await;
    }

    pub async fn notify_element_updated(&self, cache_name: &str, element: Element) {
        self.notify(MutationEvent::update(cache_name, element)).await;
    }

    pub async fn notify_element_removed(&self, cache_name: &str, key: &str) {
        self.notify(MutationEvent::remove(cache_name, key)).await;
    }

    pub async fn notify_remove_all(&self, cache_name: &str) {
        self.notify(MutationEvent::remove_all(cache_name)).await;
    }

    /// Events queued for a cache and not yet flushed
    pub fn pending(&self, cache_name: &str) -> usize {
        self.queues
            .get(cache_name)
            .map(|queue| queue.pending())
            .unwrap_or(0)
    }

    /// The batch queue for a cache, created on first use. None once shut down.
    fn queue_for(&self, cache_name: &str) -> Option<Arc<BatchQueue>> {
        if let Some(queue) = self.queues.get(cache_name) {
            return Some(queue.value().clone());
        }
        match self.queues.entry(cache_name.to_string()) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            // Checked under the shard lock so shutdown never misses a new queue
            Entry::Vacant(_) if !self.is_alive() => None,
            Entry::Vacant(entry) => {
                debug!("Creating replication queue for cache {}", cache_name);
                let queue = Arc::new(BatchQueue::start(
                    cache_name,
                    BatchQueueConfig {
                        flush_interval: self.config.async_interval,
                        max_batch_size: self.config.max_batch_size,
                    },
                    Arc::new(PeerFanout {
                        resolver: self.resolver.clone(),
                        call_timeout: self.config.call_timeout,
                    }),
                ));
                entry.insert(queue.clone());
                Some(queue)
            }
        }
    }

    async fn replicate_now(&self, event: MutationEvent) {
        let Some(message) = event.to_message() else {
            warn!(
                "{} event for key {} on {} carries no element, not replicating",
                event.kind, event.key, event.cache_name
            );
            return;
        };

        let peers = self.resolver.list_peers_for_cache(&event.cache_name).await;
        for peer in peers {
            let delivered =
                tokio::time::timeout(self.config.call_timeout, deliver(peer.as_ref(), &message))
                    .await;
            match delivered {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    metrics::record_replication_failure(&event.cache_name);
                    warn!(
                        "Unable to send {} for {} to peer {}: {}",
                        event.kind,
                        event.cache_name,
                        peer.url(),
                        e
                    );
                }
                Err(_) => {
                    metrics::record_replication_failure(&event.cache_name);
                    warn!(
                        "Timed out sending {} for {} to peer {}",
                        event.kind,
                        event.cache_name,
                        peer.url()
                    );
                }
            }
        }
    }

    /// Stop accepting events and drain every queue within the grace period
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);

        let queues: Vec<Arc<BatchQueue>> = self
            .queues
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.queues.clear();

        let discarded: usize = join_all(
            queues
                .iter()
                .map(|queue| queue.shutdown(self.config.shutdown_grace)),
        )
        .await
        .into_iter()
        .sum();

        if discarded > 0 {
            warn!(
                "Replication dispatcher shut down, {} unsent events discarded",
                discarded
            );
        } else {
            info!("Replication dispatcher shut down");
        }
    }
}

async fn deliver(peer: &dyn CachePeer, message: &EventMessage) -> Result<()> {
    match message {
        EventMessage::Put { element } => peer.put(element.clone()).await,
        EventMessage::Remove { key } => peer.remove(key).await.map(|_| ()),
        EventMessage::RemoveAll => peer.remove_all().await,
    }
}

/// Sends each flushed batch to every peer of its cache in parallel
struct PeerFanout {
    resolver: Arc<PeerResolver>,
    call_timeout: Duration,
}

#[async_trait]
impl BatchSink for PeerFanout {
    async fn transmit(&self, batch: ReplicationBatch) {
        let messages = batch.messages();
        if messages.is_empty() {
            return;
        }

        let peers = self.resolver.list_peers_for_cache(&batch.cache_name).await;
        if peers.is_empty() {
            debug!(
                "No peers for cache {}, dropping batch of {} events",
                batch.cache_name,
                messages.len()
            );
            return;
        }

        let sends = peers.iter().map(|peer| {
            let messages = messages.clone();
            async move {
                let result = tokio::time::timeout(self.call_timeout, peer.send(messages)).await;
                (peer.url(), result)
            }
        });

        for (url, result) in join_all(sends).await {
            match result {
                Ok(Ok(())) => {
                    debug!("Sent {} events for {} to {}", messages.len(), batch.cache_name, url);
                }
                Ok(Err(e)) => {
                    metrics::record_replication_failure(&batch.cache_name);
                    warn!(
                        "Unable to send batch of {} events for {} to peer {}: {}",
                        messages.len(),
                        batch.cache_name,
                        url,
                        e
                    );
                }
                Err(_) => {
                    metrics::record_replication_failure(&batch.cache_name);
                    warn!(
                        "Timed out sending batch for {} to peer {}",
                        batch.cache_name, url
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::peer_registry::PeerRegistry;
    use crate::service::remote::TcpPeerConnector;

    fn configuration(pairs: &[(&str, &str)]) -> Configuration {
        let mut builder = config::Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(*key, *value).unwrap();
        }
        Configuration::from_config(builder.build().unwrap())
    }

    #[test]
    fn test_defaults() {
        let config = ReplicatorConfig::from_configuration(&Configuration::default());
        assert!(config.replicate_puts);
        assert!(config.replicate_puts_via_copy);
        assert!(config.replicate_updates);
        assert!(config.replicate_updates_via_copy);
        assert!(config.replicate_removals);
        assert_eq!(config.mode, ReplicationMode::Asynchronous);
        assert_eq!(config.async_interval, Duration::from_millis(1000));
        assert_eq!(config.max_batch_size, 1000);
    }

    #[test]
    fn test_interval_floor() {
        assert_eq!(
            ReplicatorConfig::interval_from_millis(5),
            Duration::from_millis(1000)
        );
        assert_eq!(
            ReplicatorConfig::interval_from_millis(10),
            Duration::from_millis(10)
        );

        let config = ReplicatorConfig::from_configuration(&configuration(&[(
            "cachemesh.replication.async-interval-ms",
            "1",
        )]));
        assert_eq!(config.async_interval, Duration::from_millis(1000));
    }

    #[test]
    fn test_synchronous_from_configuration() {
        let config = ReplicatorConfig::from_configuration(&configuration(&[
            ("cachemesh.replication.replicate-asynchronously", "false"),
            ("cachemesh.replication.replicate-updates-via-copy", "false"),
        ]));
        assert_eq!(config.mode, ReplicationMode::Synchronous);
        assert!(!config.replicate_updates_via_copy);
    }

    #[test]
    fn test_accept_applies_flags() {
        let config = ReplicatorConfig {
            replicate_puts: false,
            replicate_updates_via_copy: false,
            ..ReplicatorConfig::default()
        };
        let element = Element::new("k", b"v".to_vec());

        assert!(config.accept(MutationEvent::put("c1", element.clone())).is_none());

        let update = config
            .accept(MutationEvent::update("c1", element))
            .unwrap();
        assert!(!update.via_copy);
        assert_eq!(
            update.to_message(),
            Some(EventMessage::Remove {
                key: "k".to_string()
            })
        );
    }

    #[test]
    fn test_remove_all_follows_any_flag() {
        let config = ReplicatorConfig {
            replicate_puts: false,
            replicate_updates: false,
            replicate_removals: false,
            ..ReplicatorConfig::default()
        };
        assert!(config.accept(MutationEvent::remove_all("c1")).is_none());

        let config = ReplicatorConfig {
            replicate_removals: false,
            ..ReplicatorConfig::default()
        };
        assert!(config.accept(MutationEvent::remove_all("c1")).is_some());
        assert!(config.accept(MutationEvent::remove("c1", "k")).is_none());
    }

    fn dispatcher() -> ReplicationDispatcher {
        let resolver = PeerResolver::new(
            Arc::new(PeerRegistry::new()),
            Arc::new(TcpPeerConnector::new(Duration::from_millis(200))),
        );
        ReplicationDispatcher::new(ReplicatorConfig::default(), Arc::new(resolver))
    }

    #[tokio::test]
    async fn test_no_queue_created_after_shutdown() {
        let dispatcher = dispatcher();
        dispatcher
            .notify(MutationEvent::put("c1", Element::new("k", b"v".to_vec())))
            .await;
        assert_eq!(dispatcher.pending("c1"), 1);

        dispatcher.shutdown().await;
        assert!(dispatcher.queues.is_empty());

        // A notify that passed the liveness check before shutdown lands here
        assert!(dispatcher.queue_for("c2").is_none());
        dispatcher
            .notify(MutationEvent::put("c2", Element::new("k", b"v".to_vec())))
            .await;
        assert!(dispatcher.queues.is_empty());
        assert_eq!(dispatcher.pending("c2"), 0);
    }
}
