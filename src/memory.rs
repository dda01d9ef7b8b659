//! # In-Process Overlay
//!
//! A [`MemoryNetwork`] hosts any number of overlay peers inside one process.
//! Streams between peers are `tokio::io::duplex` pairs, advertisements live
//! on a bounded in-memory board, and NAT status is injectable per peer. This
//! backs the integration tests and lets the relay binary run stand-alone,
//! bridging local clients to each other without an external network.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::overlay::{
    NatStatus, Overlay, OverlayError, OverlayStream, PeerId, PeerInfo, StreamHandler,
};

/// Buffer size of each in-process stream half.
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum distinct advertisement tags held on the board.
/// SECURITY: Bounds the board even if clients advertise unbounded tag sets;
/// oldest tags are evicted LRU.
const MAX_AD_TAGS: usize = 1024;


struct AdEntry {
    peer: PeerId,
    expires: Instant,
}

struct PeerEntry {
    handlers: HashMap<String, StreamHandler>,
}

struct NetworkInner {
    peers: HashMap<PeerId, PeerEntry>,
    ads: LruCache<String, Vec<AdEntry>>,
}

/// Shared registry of in-process overlay peers. Cheap to clone.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(MAX_AD_TAGS).expect("MAX_AD_TAGS must be non-zero");
        Self {
            inner: Arc::new(Mutex::new(NetworkInner {
                peers: HashMap::new(),
                ads: LruCache::new(cap),
            })),
        }
    }

    /// Register a new overlay peer with a fresh identity.
    pub fn create_peer(&self) -> Result<Arc<MemoryOverlay>, OverlayError> {
        self.create_peer_with_id(PeerId::generate()?)
    }

    /// Register a new overlay peer under a caller-chosen identity.
    pub fn create_peer_with_id(&self, peer: PeerId) -> Result<Arc<MemoryOverlay>, OverlayError> {
        let mut inner = self.inner.lock().expect("memory network lock poisoned");
        if inner.peers.contains_key(&peer) {
            return Err(OverlayError::Identity(format!("peer {peer} already registered")));
        }
        inner.peers.insert(peer, PeerEntry { handlers: HashMap::new() });
        drop(inner);

        let (nat_tx, _) = watch::channel(NatStatus::Unknown);
        Ok(Arc::new(MemoryOverlay {
            peer,
            network: self.inner.clone(),
            nat_tx,
            address_book: Mutex::new(HashMap::new()),
            external_address: Mutex::new(None),
        }))
    }
}


/// One peer of a [`MemoryNetwork`].
pub struct MemoryOverlay {
    peer: PeerId,
    network: Arc<Mutex<NetworkInner>>,
    nat_tx: watch::Sender<NatStatus>,
    address_book: Mutex<HashMap<PeerId, Vec<String>>>,
    external_address: Mutex<Option<String>>,
}

impl MemoryOverlay {
    /// Inject a NAT reachability observation for this peer.
    pub fn set_nat_status(&self, status: NatStatus) {
        self.nat_tx.send_replace(status);
    }

    /// Set the address this peer reports as externally observed.
    pub fn set_external_address(&self, addr: impl Into<String>) {
        *self.external_address.lock().expect("external address lock poisoned") =
            Some(addr.into());
    }

    /// Addresses recorded for a peer by `connect` calls on this overlay.
    pub fn known_addrs(&self, peer: PeerId) -> Vec<String> {
        self.address_book
            .lock()
            .expect("address book lock poisoned")
            .get(&peer)
            .cloned()
            .unwrap_or_default()
    }

    /// Peers currently advertising a tag, expiry honored. Test hook for
    /// asserting on the wire-observable tag namespace.
    pub fn advertisers(&self, tag: &str) -> Vec<PeerId> {
        let mut inner = self.network.lock().expect("memory network lock poisoned");
        let now = Instant::now();
        match inner.ads.get(tag) {
            Some(entries) => {
                entries.iter().filter(|e| e.expires > now).map(|e| e.peer).collect()
            }
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl Overlay for MemoryOverlay {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    async fn connect(&self, peer: PeerId, addrs: &[String]) -> Result<(), OverlayError> {
        {
            let inner = self.network.lock().expect("memory network lock poisoned");
            if !inner.peers.contains_key(&peer) {
                return Err(OverlayError::PeerNotFound(peer));
            }
        }
        if !addrs.is_empty() {
            self.address_book
                .lock()
                .expect("address book lock poisoned")
                .entry(peer)
                .or_default()
                .extend(addrs.iter().cloned());
        }
        Ok(())
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: &str,
    ) -> Result<OverlayStream, OverlayError> {
        let inner = self.network.lock().expect("memory network lock poisoned");
        let entry = inner.peers.get(&peer).ok_or(OverlayError::PeerNotFound(peer))?;
        let handler = entry.handlers.get(protocol).ok_or_else(|| {
            OverlayError::ProtocolUnavailable { peer, protocol: protocol.to_string() }
        })?;

        let (local_end, remote_end) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        handler(OverlayStream::new(self.peer, remote_end));
        trace!(
            from = %self.peer.short(),
            to = %peer.short(),
            protocol,
            "in-process stream opened"
        );
        Ok(OverlayStream::new(peer, local_end))
    }

    async fn set_stream_handler(
        &self,
        protocol: &str,
        handler: StreamHandler,
    ) -> Result<(), OverlayError> {
        let mut inner = self.network.lock().expect("memory network lock poisoned");
        let entry = inner
            .peers
            .get_mut(&self.peer)
            .ok_or(OverlayError::PeerNotFound(self.peer))?;
        if entry.handlers.contains_key(protocol) {
            return Err(OverlayError::HandlerExists(protocol.to_string()));
        }
        entry.handlers.insert(protocol.to_string(), handler);
        Ok(())
    }

    async fn remove_stream_handler(&self, protocol: &str) {
        let mut inner = self.network.lock().expect("memory network lock poisoned");
        if let Some(entry) = inner.peers.get_mut(&self.peer) {
            entry.handlers.remove(protocol);
        }
    }

    async fn protocols(&self) -> Vec<String> {
        let inner = self.network.lock().expect("memory network lock poisoned");
        match inner.peers.get(&self.peer) {
            Some(entry) => entry.handlers.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    fn nat_status(&self) -> watch::Receiver<NatStatus> {
        self.nat_tx.subscribe()
    }

    async fn advertise(&self, tag: &str, ttl: Duration) -> Result<(), OverlayError> {
        let mut inner = self.network.lock().expect("memory network lock poisoned");
        let now = Instant::now();
        let expires = now + ttl;
        let entries = inner.ads.get_or_insert_mut(tag.to_string(), Vec::new);
        entries.retain(|e| e.expires > now && e.peer != self.peer);
        entries.push(AdEntry { peer: self.peer, expires });
        trace!(peer = %self.peer.short(), tag, ttl_secs = ttl.as_secs(), "advertised");
        Ok(())
    }

    async fn find_peers(&self, tag: &str) -> Result<mpsc::Receiver<PeerInfo>, OverlayError> {
        let found: Vec<PeerInfo> = {
            let mut inner = self.network.lock().expect("memory network lock poisoned");
            let now = Instant::now();
            match inner.ads.get(tag) {
                Some(entries) => entries
                    .iter()
                    .filter(|e| e.expires > now && e.peer != self.peer)
                    .map(|e| PeerInfo { peer: e.peer, addrs: Vec::new() })
                    .collect(),
                None => Vec::new(),
            }
        };

        let (tx, rx) = mpsc::channel(found.len().max(1));
        for info in found {
            // Capacity covers every entry; the channel closes once tx drops.
            let _ = tx.try_send(info);
        }
        Ok(rx)
    }

    async fn external_address(&self) -> Option<String> {
        self.external_address.lock().expect("external address lock poisoned").clone()
    }
}
