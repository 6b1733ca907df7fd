//! cachemesh Core - Peer discovery and cache replication
//!
//! This crate provides:
//! - Heartbeat payload encoding sized for a single datagram
//! - Peer registry with manual and multicast discovery
//! - Resolution of peer urls into remote cache handles
//! - Synchronous and batched asynchronous replication of cache mutations
//! - Bootstrap of a freshly joined cache from a peer
//! - A TCP transport and the node that wires everything together

pub mod metrics;
pub mod model;
pub mod service;

// Re-export commonly used types
pub use model::{
    Configuration, Element, EventMessage, MutationEvent, MutationKind, ReplicationBatch,
};
pub use service::{
    CacheMeshNode, CachePeer, CacheStore, PeerConnector, PeerProvider, PeerRegistry,
    PeerResolver, ReplicatedCache, ReplicationDispatcher, ReplicatorConfig,
};

// Re-export common types
pub use cachemesh_common::{CacheMeshError, Result};
