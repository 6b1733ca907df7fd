// Multicast heartbeat peer discovery
// Each node periodically multicasts the urls of its replicated caches and
// registers the urls it hears from other nodes, dropping them once they go quiet

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cachemesh_common::{CacheMeshError, Result};

use crate::metrics;
use crate::model::{
    Configuration, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_MAX_PEERS_PER_SEND,
};

use super::payload::{self, MTU};
use super::peer_provider::{AdvertisedPeers, PeerProvider};
use super::peer_registry::PeerRegistry;

/// Restricts heartbeats to the same subnet
const DEFAULT_TIME_TO_LIVE: i64 = 1;

/// Largest datagram the receiver accepts
const RECEIVE_BUFFER_SIZE: usize = 65_535;

/// Discovery lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Not started, or stopped
    Idle,
    /// Receiver bound and joined to the group
    Listening,
    /// Receiver and heartbeat sender both running
    Advertising,
}

const STATE_IDLE: u8 = 0;
const STATE_LISTENING: u8 = 1;
const STATE_ADVERTISING: u8 = 2;

impl DiscoveryState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_LISTENING => DiscoveryState::Listening,
            STATE_ADVERTISING => DiscoveryState::Advertising,
            _ => DiscoveryState::Idle,
        }
    }
}

/// Configuration for multicast discovery
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    pub group_address: Ipv4Addr,
    pub group_port: u16,
    /// 0 keeps heartbeats on the host, 1 on the subnet
    pub time_to_live: u32,
    /// Interface to join the group on, all interfaces when unset
    pub host_address: Option<Ipv4Addr>,
    pub heartbeat_interval: Duration,
    pub stale_timeout: Duration,
    pub max_peers_per_send: usize,
}

impl MulticastConfig {
    pub fn new(group_address: Ipv4Addr, group_port: u16) -> Self {
        let heartbeat_interval = Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS);
        Self {
            group_address,
            group_port,
            time_to_live: DEFAULT_TIME_TO_LIVE as u32,
            host_address: None,
            heartbeat_interval,
            stale_timeout: heartbeat_interval * 2 + Duration::from_millis(1000),
            max_peers_per_send: DEFAULT_MAX_PEERS_PER_SEND,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.stale_timeout = interval * 2 + Duration::from_millis(1000);
        self
    }

    pub fn with_time_to_live(mut self, time_to_live: u32) -> Self {
        self.time_to_live = time_to_live;
        self
    }

    /// Build from configuration. Missing or invalid group settings and an
    /// out of range TTL are fatal.
    pub fn from_configuration(configuration: &Configuration) -> Result<Self> {
        let group_address = configuration
            .multicast_group_address()
            .ok_or_else(|| {
                CacheMeshError::Config(
                    "cachemesh.multicast.group.address is required for automatic peer discovery"
                        .to_string(),
                )
            })?;
        let group_address: Ipv4Addr = group_address.parse().map_err(|_| {
            CacheMeshError::Config(format!(
                "multicast group address '{}' is not an IPv4 address",
                group_address
            ))
        })?;
        if !group_address.is_multicast() {
            return Err(CacheMeshError::Config(format!(
                "{} is not a multicast address",
                group_address
            )));
        }

        let group_port = configuration.multicast_group_port().ok_or_else(|| {
            CacheMeshError::Config(
                "cachemesh.multicast.group.port is required for automatic peer discovery"
                    .to_string(),
            )
        })?;
        let group_port: u16 = group_port.parse().map_err(|_| {
            CacheMeshError::Config(format!("multicast group port '{}' is invalid", group_port))
        })?;

        let time_to_live: i64 = match configuration.multicast_ttl() {
            Some(raw) => raw.parse().map_err(|_| {
                CacheMeshError::Config(format!("multicast TTL '{}' is not a number", raw))
            })?,
            None => DEFAULT_TIME_TO_LIVE,
        };
        if !(0..=255).contains(&time_to_live) {
            return Err(CacheMeshError::Config(format!(
                "the multicast TTL must be between 0 and 255, got {}",
                time_to_live
            )));
        }

        let host_address = configuration
            .multicast_host_name()
            .map(|host| parse_host_address(&host))
            .transpose()?;

        Ok(Self {
            group_address,
            group_port,
            time_to_live: time_to_live as u32,
            host_address,
            heartbeat_interval: configuration.heartbeat_interval(),
            stale_timeout: configuration.peer_stale_timeout(),
            max_peers_per_send: configuration.max_peers_per_send(),
        })
    }
}

fn parse_host_address(host: &str) -> Result<Ipv4Addr> {
    if host.eq_ignore_ascii_case("localhost") {
        warn!(
            "Explicitly setting the multicast host name to 'localhost' is not recommended. \
             It will only work if all peers are on the same machine."
        );
        return Ok(Ipv4Addr::LOCALHOST);
    }
    host.parse().map_err(|_| {
        CacheMeshError::Config(format!(
            "multicast host name '{}' must be an IPv4 address",
            host
        ))
    })
}

/// Register every url in a heartbeat except this node's own.
///
/// Returns the number of newly discovered urls.
pub fn process_heartbeat(
    registry: &PeerRegistry,
    payload: &[u8],
    own_urls: &[String],
) -> Result<usize> {
    let urls = payload::disassemble(payload)?;
    let mut discovered = 0;
    for url in urls {
        if own_urls.contains(&url) {
            continue;
        }
        if registry.refresh(&url) {
            info!("Discovered cache peer: {}", url);
            discovered += 1;
        }
    }
    Ok(discovered)
}

/// Peer provider driven by multicast heartbeats
pub struct MulticastPeerProvider {
    config: MulticastConfig,
    registry: Arc<PeerRegistry>,
    advertised: Arc<dyn AdvertisedPeers>,
    state: Arc<AtomicU8>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MulticastPeerProvider {
    pub fn new(config: MulticastConfig, advertised: Arc<dyn AdvertisedPeers>) -> Self {
        let registry = Arc::new(PeerRegistry::with_stale_timeout(config.stale_timeout));
        Self {
            config,
            registry,
            advertised,
            state: Arc::new(AtomicU8::new(STATE_IDLE)),
            shutdown_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        DiscoveryState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &MulticastConfig {
        &self.config
    }

    async fn bind_receiver(&self) -> std::io::Result<UdpSocket> {
        let socket = UdpSocket::bind(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            self.config.group_port,
        ))
        .await?;
        let interface = self.config.host_address.unwrap_or(Ipv4Addr::UNSPECIFIED);
        socket.join_multicast_v4(self.config.group_address, interface)?;
        Ok(socket)
    }

    async fn bind_sender(&self) -> std::io::Result<UdpSocket> {
        let host = self.config.host_address.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let socket = UdpSocket::bind(SocketAddrV4::new(host, 0)).await?;
        socket.set_multicast_ttl_v4(self.config.time_to_live)?;
        socket.set_multicast_loop_v4(true)?;
        Ok(socket)
    }
}

#[async_trait]
impl PeerProvider for MulticastPeerProvider {
    async fn start(&self) -> Result<()> {
        if self.state() != DiscoveryState::Idle {
            debug!("Multicast peer discovery already started");
            return Ok(());
        }

        let receiver = self.bind_receiver().await.map_err(|e| {
            error!(
                "Could not join multicast group {}:{}: {}",
                self.config.group_address, self.config.group_port, e
            );
            CacheMeshError::DiscoveryStart(format!(
                "{}:{}: {}",
                self.config.group_address, self.config.group_port, e
            ))
        })?;
        self.state.store(STATE_LISTENING, Ordering::Release);

        let sender = match self.bind_sender().await {
            Ok(sender) => sender,
            Err(e) => {
                self.state.store(STATE_IDLE, Ordering::Release);
                return Err(CacheMeshError::DiscoveryStart(format!(
                    "heartbeat sender: {}",
                    e
                )));
            }
        };

        let (shutdown_tx, _) = broadcast::channel(1);

        let receive_task = tokio::spawn(run_receiver(
            receiver,
            self.registry.clone(),
            self.advertised.clone(),
            self.config.heartbeat_interval,
            shutdown_tx.subscribe(),
        ));
        let send_task = tokio::spawn(run_sender(
            sender,
            SocketAddr::V4(SocketAddrV4::new(
                self.config.group_address,
                self.config.group_port,
            )),
            self.advertised.clone(),
            self.config.heartbeat_interval,
            self.config.max_peers_per_send,
            shutdown_tx.subscribe(),
        ));

        *self.shutdown_tx.lock() = Some(shutdown_tx);
        self.tasks.lock().extend([receive_task, send_task]);
        self.state.store(STATE_ADVERTISING, Ordering::Release);

        info!(
            "Multicast peer discovery started on {}:{} (ttl {}, heartbeat every {:?})",
            self.config.group_address,
            self.config.group_port,
            self.config.time_to_live,
            self.config.heartbeat_interval
        );
        Ok(())
    }

    async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                warn!("Multicast discovery task failed: {}", e);
            }
        }

        self.state.store(STATE_IDLE, Ordering::Release);
        info!("Multicast peer discovery stopped");
    }

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
        self.config.heartbeat_interval * 2 + Duration::from_millis(100)
    }
}

impl Drop for MulticastPeerProvider {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn run_receiver(
    socket: UdpSocket,
    registry: Arc<PeerRegistry>,
    advertised: Arc<dyn AdvertisedPeers>,
    sweep_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
    let mut sweep = tokio::time::interval(sweep_interval);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = sweep.tick() => {
                for url in registry.sweep() {
                    info!("Peer {} missed its heartbeats and was removed", url);
                }
                metrics::set_peer_count(registry.len());
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) => {
                        metrics::record_heartbeat_received();
                        let own_urls = advertised.advertised_urls();
                        match process_heartbeat(&registry, &buf[..len], &own_urls) {
                            Ok(discovered) if discovered > 0 => {
                                metrics::set_peer_count(registry.len());
                            }
                            Ok(_) => {}
                            Err(e) => {
                                metrics::record_heartbeat_dropped();
                                debug!("Dropped heartbeat from {}: {}", from, e);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Error receiving heartbeat: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    debug!("Heartbeat receiver stopped");
}

async fn run_sender(
    socket: UdpSocket,
    target: SocketAddr,
    advertised: Arc<dyn AdvertisedPeers>,
    heartbeat_interval: Duration,
    max_peers_per_send: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(heartbeat_interval);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                let urls = advertised.advertised_urls();
                if urls.is_empty() {
                    continue;
                }
                for heartbeat in payload::create_compressed_payload_list(&urls, max_peers_per_send) {
                    debug_assert!(heartbeat.len() <= MTU);
                    match socket.send_to(&heartbeat, target).await {
                        Ok(_) => metrics::record_heartbeat_sent(),
                        Err(e) => warn!("Error sending heartbeat to {}: {}", target, e),
                    }
                }
            }
        }
    }

    debug!("Heartbeat sender stopped");
}
