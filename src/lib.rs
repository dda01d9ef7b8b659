//! # Pontium - Peer-to-Peer Relay Bridge
//!
//! Pontium lets a browser (or any local client) reach remote peers of a
//! distributed overlay network by speaking a simple JSON message protocol
//! over a local WebSocket. The relay multiplexes many logical streams,
//! identified by application protocol names, over a single control channel
//! per client and bridges them to and from overlay streams.
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for safe concurrent state:
//! - The relay and each client session have a public handle and a private
//!   actor; actors own all mutable state and process commands sequentially
//! - Read pumps and stream writers are detached per-connection workers that
//!   post results back to the owning actor
//! - The overlay is consumed through a trait seam, never directly
//!
//! ## Connection Model
//!
//! A client `listen`s on a protocol (accepting inbound overlay streams) or
//! `connect`s to a peer (dialing outbound). Either way the client holds only
//! an opaque 64-bit connection id; bytes flow as `data` / `connection-data`
//! records tagged with that id, optionally length-framed on the overlay
//! stream. Listen and connect are gated until the overlay has determined
//! NAT reachability.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `relay` | Process-wide actor: client registry, NAT gating, dispatch |
//! | `client` | Per-client session actor: listeners, forwarders, ids |
//! | `listener` | Per-protocol registration owning inbound connections |
//! | `connection` | One overlay stream: writer task, read pump, framing |
//! | `messages` | Control-channel wire format and peer specifiers |
//! | `overlay` | Overlay adapter trait, peer identities, NAT status |
//! | `memory` | In-process overlay for tests and stand-alone use |
//! | `ws` | WebSocket control server |

mod client;
mod connection;
mod listener;

pub mod memory;
pub mod messages;
pub mod overlay;
pub mod relay;
pub mod ws;

pub use memory::{MemoryNetwork, MemoryOverlay};
pub use messages::{ClientMessage, ConnectionId, Payload, RelayMessage};
pub use overlay::{NatStatus, Overlay, OverlayError, OverlayStream, PeerId};
pub use relay::Relay;
