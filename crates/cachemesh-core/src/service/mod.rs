pub mod batch_queue;
pub mod bootstrap;
pub mod multicast;
pub mod node;
pub mod payload;
pub mod peer_provider;
pub mod peer_registry;
pub mod remote;
pub mod replicator;
pub mod resolver;
pub mod store;

pub use batch_queue::{BatchQueue, BatchQueueConfig, BatchSink};
pub use bootstrap::{BootstrapCacheLoader, BootstrapConfig};
pub use multicast::{DiscoveryState, MulticastConfig, MulticastPeerProvider};
pub use node::{CacheMeshNode, ReplicatedCache};
pub use peer_provider::{
    AdvertisedPeers, ManualPeerProvider, PeerDiscovery, PeerProvider, create_peer_provider,
};
pub use peer_registry::PeerRegistry;
pub use remote::{PeerListener, TcpCachePeer, TcpPeerConnector};
pub use replicator::{ReplicationDispatcher, ReplicationMode, ReplicatorConfig};
pub use resolver::{CachePeer, PeerConnector, PeerResolver, extract_cache_name, is_same_cache};
pub use store::{CacheStore, MemoryCacheStore};
