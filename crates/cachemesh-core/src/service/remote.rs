//! TCP transport for remote cache calls
//!
//! Peer urls have the form `tcp://host:port/cacheName`. Each request and
//! response is a JSON document preceded by its length as a big-endian u32.
//! The listener serves every cache registered with it on a single port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use cachemesh_common::{CacheMeshError, Result};

use crate::model::{Configuration, Element, EventMessage};

use super::peer_provider::AdvertisedPeers;
use super::resolver::{CachePeer, PeerConnector};
use super::store::CacheStore;

pub const URL_SCHEME: &str = "tcp";

/// Largest frame either side accepts
pub(crate) const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerRequest {
    Ping { cache_name: String },
    Put { cache_name: String, element: Element },
    Remove { cache_name: String, key: String },
    RemoveAll { cache_name: String },
    Send { cache_name: String, messages: Vec<EventMessage> },
    Keys { cache_name: String },
    GetElements { cache_name: String, keys: Vec<String> },
}

impl PeerRequest {
    pub fn cache_name(&self) -> &str {
        match self {
            PeerRequest::Ping { cache_name }
            | PeerRequest::Put { cache_name, .. }
            | PeerRequest::Remove { cache_name, .. }
            | PeerRequest::RemoveAll { cache_name }
            | PeerRequest::Send { cache_name, .. }
            | PeerRequest::Keys { cache_name }
            | PeerRequest::GetElements { cache_name, .. } => cache_name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerResponse {
    Ok,
    Removed { removed: bool },
    Keys { keys: Vec<String> },
    Elements { elements: Vec<Element> },
    Error { message: String },
}

pub fn format_url(host: &str, port: u16, cache_name: &str) -> String {
    format!("{}://{}:{}/{}", URL_SCHEME, host, port, cache_name)
}

/// Split a peer url into its socket address and cache name
pub fn parse_url(url: &str) -> Result<(String, String)> {
    let invalid = || CacheMeshError::RemoteCommunication(format!("invalid peer url '{}'", url));

    let rest = url
        .strip_prefix(URL_SCHEME)
        .and_then(|rest| rest.strip_prefix("://"))
        .ok_or_else(invalid)?;
    let (address, cache_name) = rest.split_once('/').ok_or_else(invalid)?;
    if address.is_empty() || cache_name.is_empty() || !address.contains(':') {
        return Err(invalid());
    }
    Ok((address.to_string(), cache_name.to_string()))
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_BYTES)
        .ok_or_else(|| {
            CacheMeshError::RemoteCommunication(format!("frame of {} bytes is too large", body.len()))
        })?;
    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns None when the other side closed cleanly.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(CacheMeshError::CorruptPayload(format!(
            "frame length {} exceeds {}",
            len, MAX_FRAME_BYTES
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Handle to a cache on a remote listener.
///
/// Holds at most one connection, opened on first use and dropped after any
/// failure so the next call reconnects.
pub struct TcpCachePeer {
    url: String,
    address: String,
    cache_name: String,
    timeout: Duration,
    stream: tokio::sync::Mutex<Option<TcpStream>>,
}

impl TcpCachePeer {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let (address, cache_name) = parse_url(url)?;
        Ok(Self {
            url: url.to_string(),
            address,
            cache_name,
            timeout,
            stream: tokio::sync::Mutex::new(None),
        })
    }

    pub async fn ping(&self) -> Result<()> {
        self.call(PeerRequest::Ping {
            cache_name: self.cache_name.clone(),
        })
        .await
        .map(|_| ())
    }

    async fn call(&self, request: PeerRequest) -> Result<PeerResponse> {
        let mut stream = self.stream.lock().await;
        let exchanged =
            tokio::time::timeout(self.timeout, exchange(&mut stream, &self.address, &request))
                .await;

        match exchanged {
            Ok(Ok(PeerResponse::Error { message })) => {
                Err(CacheMeshError::RemoteCommunication(message))
            }
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                *stream = None;
                Err(e)
            }
            Err(_) => {
                *stream = None;
                Err(CacheMeshError::RemoteCommunication(format!(
                    "call to {} timed out after {:?}",
                    self.url, self.timeout
                )))
            }
        }
    }

    fn unexpected(&self, response: PeerResponse) -> CacheMeshError {
        CacheMeshError::RemoteCommunication(format!(
            "unexpected response from {}: {:?}",
            self.url, response
        ))
    }
}

async fn exchange(
    slot: &mut Option<TcpStream>,
    address: &str,
    request: &PeerRequest,
) -> Result<PeerResponse> {
    if slot.is_none() {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        *slot = Some(stream);
    }
    let Some(stream) = slot.as_mut() else {
        return Err(CacheMeshError::IllegalState(format!(
            "no connection to {}",
            address
        )));
    };

    write_frame(stream, request).await?;
    read_frame(stream).await?.ok_or_else(|| {
        CacheMeshError::RemoteCommunication(format!("connection to {} closed", address))
    })
}

#[async_trait]
impl CachePeer for TcpCachePeer {
    fn url(&self) -> &str {
        &self.url
    }

    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    async fn put(&self, element: Element) -> Result<()> {
        match self
            .call(PeerRequest::Put {
                cache_name: self.cache_name.clone(),
                element,
            })
            .await?
        {
            PeerResponse::Ok => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        match self
            .call(PeerRequest::Remove {
                cache_name: self.cache_name.clone(),
                key: key.to_string(),
            })
            .await?
        {
            PeerResponse::Removed { removed } => Ok(removed),
            other => Err(self.unexpected(other)),
        }
    }

    async fn remove_all(&self) -> Result<()> {
        match self
            .call(PeerRequest::RemoveAll {
                cache_name: self.cache_name.clone(),
            })
            .await?
        {
            PeerResponse::Ok => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    async fn send(&self, messages: Vec<EventMessage>) -> Result<()> {
        match self
            .call(PeerRequest::Send {
                cache_name: self.cache_name.clone(),
                messages,
            })
            .await?
        {
            PeerResponse::Ok => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        match self
            .call(PeerRequest::Keys {
                cache_name: self.cache_name.clone(),
            })
            .await?
        {
            PeerResponse::Keys { keys } => Ok(keys),
            other => Err(self.unexpected(other)),
        }
    }

    async fn get_elements(&self, keys: &[String]) -> Result<Vec<Element>> {
        match self
            .call(PeerRequest::GetElements {
                cache_name: self.cache_name.clone(),
                keys: keys.to_vec(),
            })
            .await?
        {
            PeerResponse::Elements { elements } => Ok(elements),
            other => Err(self.unexpected(other)),
        }
    }
}

/// Connector that caches one handle per url and pings it on every lookup
pub struct TcpPeerConnector {
    timeout: Duration,
    peers: DashMap<String, Arc<TcpCachePeer>>,
}

impl TcpPeerConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            peers: DashMap::new(),
        }
    }

    /// Number of cached handles
    pub fn cached(&self) -> usize {
        self.peers.len()
    }
}

#[async_trait]
impl PeerConnector for TcpPeerConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn CachePeer>> {
        let cached = self.peers.get(url).map(|peer| peer.value().clone());
        let peer = match cached {
            Some(peer) => peer,
            None => {
                let peer = Arc::new(TcpCachePeer::new(url, self.timeout)?);
                self.peers.insert(url.to_string(), peer.clone());
                peer
            }
        };

        if let Err(e) = peer.ping().await {
            self.peers.remove(url);
            return Err(e);
        }
        Ok(peer)
    }
}

/// Serves the caches of this node to remote peers
pub struct PeerListener {
    host_name: String,
    requested_port: u16,
    port: AtomicU16,
    socket_timeout: Duration,
    caches: Arc<DashMap<String, Arc<dyn CacheStore>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerListener {
    /// Port 0 binds an ephemeral port
    pub fn new(host_name: impl Into<String>, port: u16) -> Self {
        Self {
            host_name: host_name.into(),
            requested_port: port,
            port: AtomicU16::new(port),
            socket_timeout: Duration::from_secs(120),
            caches: Arc::new(DashMap::new()),
            accept_task: Mutex::new(None),
        }
    }

    pub fn from_configuration(configuration: &Configuration) -> Self {
        let mut listener = Self::new(
            configuration.listener_host_name(),
            configuration.listener_port(),
        );
        listener.socket_timeout = configuration.socket_timeout();
        listener
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Bound port once started, the configured port before
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    pub fn url_for(&self, cache_name: &str) -> String {
        format_url(&self.host_name, self.port(), cache_name)
    }

    pub fn register_cache(&self, store: Arc<dyn CacheStore>) {
        debug!("Listener serving cache {}", store.name());
        self.caches.insert(store.name().to_string(), store);
    }

    pub fn unregister_cache(&self, cache_name: &str) {
        self.caches.remove(cache_name);
    }

    pub fn is_running(&self) -> bool {
        self.accept_task.lock().is_some()
    }

    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind((self.host_name.as_str(), self.requested_port)).await?;
        let local_addr = listener.local_addr()?;
        self.port.store(local_addr.port(), Ordering::Release);

        let task = tokio::spawn(run_listener(
            listener,
            self.caches.clone(),
            self.socket_timeout,
        ));
        if let Some(previous) = self.accept_task.lock().replace(task) {
            previous.abort();
        }

        info!("Peer listener started on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop accepting and close every open connection
    pub fn stop(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
            info!("Peer listener on port {} stopped", self.port());
        }
    }
}

impl AdvertisedPeers for PeerListener {
    fn advertised_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .caches
            .iter()
            .map(|entry| self.url_for(entry.key()))
            .collect();
        urls.sort();
        urls
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }
}

async fn run_listener(
    listener: TcpListener,
    caches: Arc<DashMap<String, Arc<dyn CacheStore>>>,
    idle_timeout: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!("Accepted peer connection from {}", remote);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Could not set TCP_NODELAY for {}: {}", remote, e);
                    }
                    connections.spawn(serve_connection(stream, remote, caches.clone(), idle_timeout));
                }
                Err(e) => {
                    warn!("Error accepting peer connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    caches: Arc<DashMap<String, Arc<dyn CacheStore>>>,
    idle_timeout: Duration,
) {
    loop {
        let request: PeerRequest =
            match tokio::time::timeout(idle_timeout, read_frame(&mut stream)).await {
                Ok(Ok(Some(request))) => request,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    debug!("Dropping connection from {}: {}", remote, e);
                    break;
                }
                Err(_) => {
                    debug!("Connection from {} idle for {:?}, closing", remote, idle_timeout);
                    break;
                }
            };

        let response = handle_request(request, &caches);
        if let Err(e) = write_frame(&mut stream, &response).await {
            debug!("Could not answer {}: {}", remote, e);
            break;
        }
    }
}

fn handle_request(
    request: PeerRequest,
    caches: &DashMap<String, Arc<dyn CacheStore>>,
) -> PeerResponse {
    let Some(store) = caches
        .get(request.cache_name())
        .map(|entry| entry.value().clone())
    else {
        return PeerResponse::Error {
            message: format!("no cache named '{}' on this node", request.cache_name()),
        };
    };

    match request {
        PeerRequest::Ping { .. } => PeerResponse::Ok,
        PeerRequest::Put { element, .. } => {
            store.put_quiet(element);
            PeerResponse::Ok
        }
        PeerRequest::Remove { key, .. } => PeerResponse::Removed {
            removed: store.remove_quiet(&key),
        },
        PeerRequest::RemoveAll { .. } => {
            store.remove_all_quiet();
            PeerResponse::Ok
        }
        PeerRequest::Send { messages, .. } => {
            for message in messages {
                store.apply(message);
            }
            PeerResponse::Ok
        }
        PeerRequest::Keys { .. } => PeerResponse::Keys { keys: store.keys() },
        PeerRequest::GetElements { keys, .. } => PeerResponse::Elements {
            elements: keys.iter().filter_map(|key| store.get_quiet(key)).collect(),
        },
    }
}
