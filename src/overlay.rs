//! # Overlay Adapter
//!
//! This module defines the seam between the relay core and the peer-to-peer
//! overlay network. The core never touches peer routing, transports, or NAT
//! detection directly; everything it needs is expressed by the [`Overlay`]
//! trait:
//!
//! | Capability | Used by |
//! |------------|---------|
//! | `connect` / `open_stream` | outbound connections (`connect` command) |
//! | `set_stream_handler` / `remove_stream_handler` | listeners |
//! | `protocols` | duplicate-listen detection |
//! | `nat_status` | NAT gating of listen/connect operations |
//! | `advertise` / `find_peers` | discovery-assisted listen/connect |
//!
//! ## Identity Model
//!
//! A [`PeerId`] is an opaque 32-byte identity rendered as hex. The relay only
//! parses, compares, and prints identities; key material and proof of
//! ownership live behind the overlay implementation.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};


// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("invalid peer id {0:?}")]
    InvalidPeerId(String),

    #[error("identity generation failed: {0}")]
    Identity(String),

    #[error("peer {0} is not reachable")]
    PeerNotFound(PeerId),

    #[error("peer {peer} does not handle protocol {protocol:?}")]
    ProtocolUnavailable { peer: PeerId, protocol: String },

    #[error("a stream handler for {0:?} is already registered")]
    HandlerExists(String),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("no discovered peer accepted a stream for {0:?}")]
    Discovery(String),
}


// ============================================================================
// PeerId
// ============================================================================

/// Length of a peer identity in bytes.
pub const PEER_ID_LEN: usize = 32;

/// Opaque 32-byte peer identity, rendered as 64 hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh identity from the OS CSPRNG.
    pub fn generate() -> Result<Self, OverlayError> {
        let mut bytes = [0u8; PEER_ID_LEN];
        getrandom::getrandom(&mut bytes).map_err(|e| OverlayError::Identity(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, OverlayError> {
        let raw = hex::decode(s).map_err(|_| OverlayError::InvalidPeerId(s.to_string()))?;
        let bytes: [u8; PEER_ID_LEN] = raw
            .try_into()
            .map_err(|_| OverlayError::InvalidPeerId(s.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// First 8 hex characters, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}


// ============================================================================
// NAT status
// ============================================================================

/// Reachability classification sourced from the overlay.
///
/// The relay defers listen/connect operations while the status is `Unknown`;
/// see the relay module for the gating rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatStatus {
    Unknown,
    Public,
    Private,
}

impl fmt::Display for NatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatStatus::Unknown => f.write_str("unknown"),
            NatStatus::Public => f.write_str("public"),
            NatStatus::Private => f.write_str("private"),
        }
    }
}


// ============================================================================
// Streams
// ============================================================================

/// Object-safe alias for the byte channels the overlay hands out.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

pub type OverlayReadHalf = ReadHalf<Box<dyn StreamIo>>;
pub type OverlayWriteHalf = WriteHalf<Box<dyn StreamIo>>;

/// A bidirectional ordered byte channel to a remote peer, tagged with the
/// identity of that peer. The relay splits it into pump and writer halves.
pub struct OverlayStream {
    remote: PeerId,
    io: Box<dyn StreamIo>,
}

impl OverlayStream {
    pub fn new(remote: PeerId, io: impl StreamIo + 'static) -> Self {
        Self { remote, io: Box::new(io) }
    }

    pub fn remote(&self) -> PeerId {
        self.remote
    }

    pub fn into_split(self) -> (OverlayReadHalf, OverlayWriteHalf) {
        tokio::io::split(self.io)
    }
}

impl fmt::Debug for OverlayStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OverlayStream(remote={})", self.remote.short())
    }
}

/// Callback invoked for each inbound stream of a registered protocol.
///
/// Handlers must not block: the relay's handlers only enqueue the stream on
/// the owning client's command queue.
pub type StreamHandler = Box<dyn Fn(OverlayStream) + Send + Sync>;

/// A peer discovered under an advertisement tag, with the addresses the
/// overlay knows for it.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub peer: PeerId,
    pub addrs: Vec<String>,
}


// ============================================================================
// Overlay trait
// ============================================================================

/// Abstract capabilities the relay core requires from the overlay host.
///
/// Implementations must be cheap to share (`Arc<dyn Overlay>`); every method
/// may be called concurrently from detached tasks.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Identity of the local overlay host.
    fn local_peer(&self) -> PeerId;

    /// Establish (or confirm) a session with a peer, seeding the address
    /// book with any out-of-band addresses supplied by the caller.
    async fn connect(&self, peer: PeerId, addrs: &[String]) -> Result<(), OverlayError>;

    /// Open a stream to a connected peer for an application protocol.
    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<OverlayStream, OverlayError>;

    /// Register a handler for inbound streams of a protocol.
    ///
    /// Protocol handlers are a host-global namespace: registering a protocol
    /// that already has a handler fails with [`OverlayError::HandlerExists`].
    async fn set_stream_handler(
        &self,
        protocol: &str,
        handler: StreamHandler,
    ) -> Result<(), OverlayError>;

    /// Deregister a protocol handler. No-op if absent.
    async fn remove_stream_handler(&self, protocol: &str);

    /// Protocols with a registered handler on this host.
    async fn protocols(&self) -> Vec<String>;

    /// NAT reachability source. The channel holds the current status and
    /// emits at least one value; consumers gate on the first transition away
    /// from [`NatStatus::Unknown`].
    fn nat_status(&self) -> watch::Receiver<NatStatus>;

    /// Advertise a rendezvous tag for `ttl`.
    async fn advertise(&self, tag: &str, ttl: Duration) -> Result<(), OverlayError>;

    /// Find peers currently advertising a tag. The channel closes once all
    /// known advertisers have been yielded.
    async fn find_peers(&self, tag: &str) -> Result<mpsc::Receiver<PeerInfo>, OverlayError>;

    /// Externally observed address of this host, when the overlay knows one.
    async fn external_address(&self) -> Option<String>;
}
