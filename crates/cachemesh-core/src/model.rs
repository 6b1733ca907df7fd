// Core data models and structures
// This file defines the configuration wrapper, cache elements and replication events

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use cachemesh_common::{current_time_millis, local_ip};

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5000;
pub const MINIMUM_HEARTBEAT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MAX_PEERS_PER_SEND: usize = 500;
pub const DEFAULT_LISTENER_PORT: u16 = 40001;
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 120_000;

/// Typed view over the layered configuration.
///
/// A missing key silently falls back to its default. A key that is present
/// but cannot be parsed is logged at warn and also falls back.
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: config::Config,
}

impl Configuration {
    pub fn from_config(config: config::Config) -> Self {
        Configuration { config }
    }

    fn int_or(&self, key: &str, default: i64) -> i64 {
        match self.config.get_int(key) {
            Ok(value) => value,
            Err(config::ConfigError::NotFound(_)) => default,
            Err(e) => {
                warn!(
                    "Could not parse value for {}: {}. Using the default {} instead.",
                    key, e, default
                );
                default
            }
        }
    }

    fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.config.get_bool(key) {
            Ok(value) => value,
            Err(config::ConfigError::NotFound(_)) => default,
            Err(e) => {
                warn!(
                    "Could not parse value for {}: {}. Using the default {} instead.",
                    key, e, default
                );
                default
            }
        }
    }

    fn string(&self, key: &str) -> Option<String> {
        self.config
            .get_string(key)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.string(key)
            .map(|s| {
                s.split(['|', ','])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    // Peer discovery

    pub fn peer_discovery(&self) -> String {
        self.string("cachemesh.peer.discovery")
            .unwrap_or_else(|| "automatic".to_string())
    }

    /// Manually configured peer urls, `|` separated in the source value.
    pub fn peer_urls(&self) -> Vec<String> {
        self.string("cachemesh.peer.urls")
            .map(|s| {
                s.split('|')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn multicast_group_address(&self) -> Option<String> {
        self.string("cachemesh.multicast.group.address")
    }

    /// Raw group port. Validation is left to the multicast provider.
    pub fn multicast_group_port(&self) -> Option<String> {
        self.string("cachemesh.multicast.group.port")
    }

    /// Raw TTL. Validation is left to the multicast provider.
    pub fn multicast_ttl(&self) -> Option<String> {
        self.string("cachemesh.multicast.ttl")
    }

    pub fn multicast_host_name(&self) -> Option<String> {
        self.string("cachemesh.multicast.host.name")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        let millis = self.int_or(
            "cachemesh.multicast.heartbeat.interval.ms",
            DEFAULT_HEARTBEAT_INTERVAL_MS as i64,
        );
        if millis < MINIMUM_HEARTBEAT_INTERVAL_MS as i64 {
            warn!(
                "Heartbeat interval {}ms is below the minimum of {}ms. Using the minimum instead.",
                millis, MINIMUM_HEARTBEAT_INTERVAL_MS
            );
            return Duration::from_millis(MINIMUM_HEARTBEAT_INTERVAL_MS);
        }
        Duration::from_millis(millis as u64)
    }

    /// Time after which a discovered peer without heartbeats is dropped.
    pub fn peer_stale_timeout(&self) -> Duration {
        let default = self.heartbeat_interval() * 2 + Duration::from_millis(1000);
        match self.int_or("cachemesh.multicast.stale.timeout.ms", -1) {
            millis if millis > 0 => Duration::from_millis(millis as u64),
            _ => default,
        }
    }

    pub fn max_peers_per_send(&self) -> usize {
        let value = self.int_or(
            "cachemesh.multicast.max.peers.per.send",
            DEFAULT_MAX_PEERS_PER_SEND as i64,
        );
        if value < 1 {
            warn!(
                "max peers per send must be positive, got {}. Using the default {} instead.",
                value, DEFAULT_MAX_PEERS_PER_SEND
            );
            return DEFAULT_MAX_PEERS_PER_SEND;
        }
        value as usize
    }

    // Replication

    pub fn replicate_puts(&self) -> bool {
        self.bool_or("cachemesh.replication.replicate-puts", true)
    }

    pub fn replicate_puts_via_copy(&self) -> bool {
        self.bool_or("cachemesh.replication.replicate-puts-via-copy", true)
    }

    pub fn replicate_updates(&self) -> bool {
        self.bool_or("cachemesh.replication.replicate-updates", true)
    }

    pub fn replicate_updates_via_copy(&self) -> bool {
        self.bool_or("cachemesh.replication.replicate-updates-via-copy", true)
    }

    pub fn replicate_removals(&self) -> bool {
        self.bool_or("cachemesh.replication.replicate-removals", true)
    }

    pub fn replicate_asynchronously(&self) -> bool {
        self.bool_or("cachemesh.replication.replicate-asynchronously", true)
    }

    /// Raw async interval in milliseconds. The replicator applies the floor.
    pub fn async_replication_interval_ms(&self) -> i64 {
        self.int_or("cachemesh.replication.async-interval-ms", 1000)
    }

    pub fn async_max_batch_size(&self) -> i64 {
        self.int_or("cachemesh.replication.async-max-batch-size", 1000)
    }

    pub fn replication_shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.int_or("cachemesh.replication.shutdown-grace-ms", 3000).max(0) as u64)
    }

    // Listener

    pub fn listener_host_name(&self) -> String {
        self.string("cachemesh.listener.host.name")
            .unwrap_or_else(local_ip)
    }

    pub fn listener_port(&self) -> u16 {
        let port = self.int_or("cachemesh.listener.port", DEFAULT_LISTENER_PORT as i64);
        match u16::try_from(port) {
            Ok(port) => port,
            Err(_) => {
                warn!(
                    "Listener port {} is out of range. Using the default {} instead.",
                    port, DEFAULT_LISTENER_PORT
                );
                DEFAULT_LISTENER_PORT
            }
        }
    }

    pub fn socket_timeout(&self) -> Duration {
        let millis = self.int_or(
            "cachemesh.listener.socket.timeout.ms",
            DEFAULT_SOCKET_TIMEOUT_MS as i64,
        );
        if millis <= 0 {
            return Duration::from_millis(DEFAULT_SOCKET_TIMEOUT_MS);
        }
        Duration::from_millis(millis as u64)
    }

    // Bootstrap

    pub fn bootstrap_enabled(&self) -> bool {
        self.bool_or("cachemesh.bootstrap.enabled", true)
    }

    pub fn bootstrap_asynchronously(&self) -> bool {
        self.bool_or("cachemesh.bootstrap.asynchronously", true)
    }

    pub fn bootstrap_maximum_chunk_size_bytes(&self) -> i64 {
        self.int_or("cachemesh.bootstrap.maximum.chunk.size.bytes", 5_000_000)
    }

    // Node

    pub fn caches(&self) -> Vec<String> {
        self.list("cachemesh.caches")
    }

    pub fn metrics_port(&self) -> Option<u16> {
        self.config
            .get_int("cachemesh.metrics.port")
            .ok()
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p > 0)
    }
}

/// A cache entry as stored locally and shipped to peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub key: String,
    pub value: Vec<u8>,
    pub version: i64,
    pub creation_time: i64,
}

impl Element {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Element {
            key: key.into(),
            value: value.into(),
            version: 1,
            creation_time: current_time_millis(),
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Size of the element on the wire, used to size bootstrap chunks.
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self)
            .map(|bytes| bytes.len())
            .unwrap_or(self.key.len() + self.value.len())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Put,
    Update,
    Remove,
    RemoveAll,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationKind::Put => "put",
            MutationKind::Update => "update",
            MutationKind::Remove => "remove",
            MutationKind::RemoveAll => "removeAll",
        };
        write!(f, "{}", name)
    }
}

/// A local cache mutation that may need to reach peers.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationEvent {
    pub kind: MutationKind,
    pub cache_name: String,
    pub key: String,
    pub element: Option<Element>,
    /// Ship the element itself (true) or an invalidation of its key (false)
    pub via_copy: bool,
}

impl MutationEvent {
    pub fn put(cache_name: impl Into<String>, element: Element) -> Self {
        Self::with_element(MutationKind::Put, cache_name, element)
    }

    pub fn update(cache_name: impl Into<String>, element: Element) -> Self {
        Self::with_element(MutationKind::Update, cache_name, element)
    }

    pub fn remove(cache_name: impl Into<String>, key: impl Into<String>) -> Self {
        MutationEvent {
            kind: MutationKind::Remove,
            cache_name: cache_name.into(),
            key: key.into(),
            element: None,
            via_copy: false,
        }
    }

    pub fn remove_all(cache_name: impl Into<String>) -> Self {
        MutationEvent {
            kind: MutationKind::RemoveAll,
            cache_name: cache_name.into(),
            key: String::new(),
            element: None,
            via_copy: false,
        }
    }

    fn with_element(kind: MutationKind, cache_name: impl Into<String>, element: Element) -> Self {
        MutationEvent {
            kind,
            cache_name: cache_name.into(),
            key: element.key.clone(),
            element: Some(element),
            via_copy: true,
        }
    }

    pub fn with_via_copy(mut self, via_copy: bool) -> Self {
        self.via_copy = via_copy;
        self
    }

    /// The message a peer applies for this event.
    ///
    /// Puts and updates not sent by copy become a removal of the key, so the
    /// peer drops its stale entry instead of receiving the value.
    pub fn to_message(&self) -> Option<EventMessage> {
        match self.kind {
            MutationKind::Put | MutationKind::Update if self.via_copy => self
                .element
                .clone()
                .map(|element| EventMessage::Put { element }),
            MutationKind::Put | MutationKind::Update | MutationKind::Remove => {
                Some(EventMessage::Remove {
                    key: self.key.clone(),
                })
            }
            MutationKind::RemoveAll => Some(EventMessage::RemoveAll),
        }
    }
}

/// The unit applied by a peer's cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventMessage {
    Put { element: Element },
    Remove { key: String },
    RemoveAll,
}

/// Events for one cache, flushed together.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicationBatch {
    pub cache_name: String,
    pub events: Vec<MutationEvent>,
}

impl ReplicationBatch {
    pub fn new(cache_name: impl Into<String>, events: Vec<MutationEvent>) -> Self {
        ReplicationBatch {
            cache_name: cache_name.into(),
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Messages in enqueue order.
    pub fn messages(&self) -> Vec<EventMessage> {
        self.events
            .iter()
            .filter_map(MutationEvent::to_message)
            .collect()
    }
}
