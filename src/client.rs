//! # Client Sessions
//!
//! One [`ClientSession`] exists per local control channel. All session state
//! lives in a private actor ([`ClientActor`]) drained by a single worker;
//! handles, stream handlers, and detached overlay tasks communicate with it
//! exclusively through [`ClientCommand`]s, so no lock ever guards session
//! state and no overlay call ever runs on the actor turn.
//!
//! ## State
//!
//! - `listeners`: protocol → [`Listener`] (at most one per protocol)
//! - `listener_index`: connection id → protocol (reverse index for
//!   inbound-derived connections)
//! - `forwarders`: connection id → outbound-derived [`Connection`]
//!
//! Every id lives in exactly one of `listener_index` / `forwarders`, and ids
//! are allocated from a monotone counter, so the id alone identifies a
//! connection to the local client.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, Role};
use crate::listener::Listener;
use crate::messages::{
    discovery_tag, parse_peer_spec, ConnectionId, RelayMessage, DISCOVERY_ATTEMPTS,
    DISCOVERY_REFRESH, DISCOVERY_TTL,
};
use crate::overlay::{NatStatus, Overlay, OverlayError, OverlayStream, StreamHandler};

/// Close reason for data sent to an id this client does not hold.
pub const REASON_UNKNOWN_CONNECTION: &str = "unknown connection";

/// Handler install/deregister work, run by a per-client worker in posting
/// order. Serializing these keeps stop-then-listen on the same protocol
/// deterministic without ever blocking the actor turn; dials stay on
/// independent tasks.
type OverlayOp = Pin<Box<dyn Future<Output = ()> + Send>>;


// ============================================================================
// Commands
// ============================================================================

/// Commands processed by the session actor. The first group mirrors the
/// control-channel operations (posted by the relay dispatcher); the second
/// group carries results posted back by detached tasks.
pub(crate) enum ClientCommand {
    Listen { protocol: String, frames: bool },
    Stop { protocol: String, retain: bool },
    Connect { protocol: String, peer_spec: String, frames: bool, relay: bool },
    DiscoveryListen { protocol: String, frames: bool, public: bool },
    DiscoveryConnect { protocol: String, frames: bool },
    Close { id: ConnectionId },
    Data { id: ConnectionId, data: Vec<u8> },
    NatKnown { status: NatStatus },
    Shutdown,

    // Internal: posted back to the actor by detached tasks.
    InboundStream { protocol: String, stream: OverlayStream },
    ListenReady { protocol: String },
    ListenFailed { protocol: String, reason: String },
    Opened { protocol: String, frames: bool, stream: OverlayStream },
    Refused { peer: String, protocol: String, reason: String },
    StreamClosed { id: ConnectionId, reason: String },
}


// ============================================================================
// Handle
// ============================================================================

/// Handle to a session actor. Cheap to clone.
#[derive(Clone)]
pub(crate) struct ClientSession {
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
}

impl ClientSession {
    /// Spawn the actor for a freshly opened control channel. `outbound`
    /// feeds the channel's writer; dropping the receiver ends the session's
    /// ability to notify but never blocks it.
    pub fn spawn(
        client_id: u64,
        overlay: Arc<dyn Overlay>,
        outbound: mpsc::UnboundedSender<RelayMessage>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ops_tx, mut ops_rx) = mpsc::unbounded_channel::<OverlayOp>();
        tokio::spawn(async move {
            while let Some(op) = ops_rx.recv().await {
                op.await;
            }
        });

        let actor = ClientActor {
            client_id,
            overlay,
            outbound,
            cmd_tx: cmd_tx.clone(),
            ops_tx,
            next_id: 0,
            listeners: HashMap::new(),
            listener_index: HashMap::new(),
            forwarders: HashMap::new(),
            advertisements: HashMap::new(),
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Post a command; silently dropped once the actor has shut down.
    pub fn send(&self, command: ClientCommand) {
        let _ = self.cmd_tx.send(command);
    }
}


// ============================================================================
// Actor
// ============================================================================

struct ClientActor {
    client_id: u64,
    overlay: Arc<dyn Overlay>,
    outbound: mpsc::UnboundedSender<RelayMessage>,
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
    ops_tx: mpsc::UnboundedSender<OverlayOp>,
    next_id: u64,
    listeners: HashMap<String, Listener>,
    listener_index: HashMap<ConnectionId, String>,
    forwarders: HashMap<ConnectionId, Connection>,
    /// Discovery refresh loops, keyed by protocol.
    advertisements: HashMap<String, JoinHandle<()>>,
}

impl ClientActor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<ClientCommand>) {
        debug!(client = self.client_id, "client session started");
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                ClientCommand::Listen { protocol, frames } => self.listen(protocol, frames),
                ClientCommand::Stop { protocol, retain } => self.stop(&protocol, retain),
                ClientCommand::Connect { protocol, peer_spec, frames, relay } => {
                    self.connect(protocol, peer_spec, frames, relay)
                }
                ClientCommand::DiscoveryListen { protocol, frames, public } => {
                    self.discovery_listen(protocol, frames, public)
                }
                ClientCommand::DiscoveryConnect { protocol, frames } => {
                    self.discovery_connect(protocol, frames)
                }
                ClientCommand::Close { id } => self.close(id),
                ClientCommand::Data { id, data } => self.data(id, data),
                ClientCommand::NatKnown { status } => {
                    self.emit(RelayMessage::NatStatus { status })
                }
                ClientCommand::InboundStream { protocol, stream } => {
                    self.inbound_stream(&protocol, stream)
                }
                ClientCommand::ListenReady { protocol } => self.listen_ready(&protocol),
                ClientCommand::ListenFailed { protocol, reason } => {
                    self.listen_failed(protocol, reason)
                }
                ClientCommand::Opened { protocol, frames, stream } => {
                    self.opened(protocol, frames, stream)
                }
                ClientCommand::Refused { peer, protocol, reason } => {
                    self.emit(RelayMessage::ConnectionRefused { peer, protocol, reason })
                }
                ClientCommand::StreamClosed { id, reason } => self.stream_closed(id, reason),
                ClientCommand::Shutdown => break,
            }
        }
        self.teardown();
        debug!(client = self.client_id, "client session ended");
    }

    fn emit(&self, message: RelayMessage) {
        // The control channel may already be gone during teardown.
        let _ = self.outbound.send(message);
    }

    /// Ids are unique per client and strictly increasing; the id is handed
    /// out before the corresponding connection notification is emitted.
    fn next_connection_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId(self.next_id)
    }

    // ------------------------------------------------------------------
    // Listen
    // ------------------------------------------------------------------

    fn listen(&mut self, protocol: String, frames: bool) {
        if self.listeners.contains_key(&protocol) {
            self.emit(RelayMessage::ListenRefused {
                protocol: protocol.clone(),
                reason: format!("already listening to {protocol}"),
            });
            return;
        }

        // Reserve the protocol slot immediately so a second listen (or an
        // inbound stream racing the handler install) sees consistent state.
        self.listeners.insert(protocol.clone(), Listener::new(protocol.clone(), frames));
        info!(client = self.client_id, protocol = %protocol, frames, "listen requested");

        let overlay = self.overlay.clone();
        let cmd_tx = self.cmd_tx.clone();
        let _ = self.ops_tx.send(Box::pin(async move {
            // Handler registration is a host-global namespace; refuse when
            // any session already serves this protocol.
            if overlay.protocols().await.iter().any(|p| p == &protocol) {
                let _ = cmd_tx.send(ClientCommand::ListenFailed {
                    reason: format!("already listening to {protocol}"),
                    protocol,
                });
                return;
            }

            let handler_tx = cmd_tx.clone();
            let handler_protocol = protocol.clone();
            let handler: StreamHandler = Box::new(move |stream| {
                let _ = handler_tx.send(ClientCommand::InboundStream {
                    protocol: handler_protocol.clone(),
                    stream,
                });
            });

            match overlay.set_stream_handler(&protocol, handler).await {
                Ok(()) => {
                    let _ = cmd_tx.send(ClientCommand::ListenReady { protocol });
                }
                Err(e) => {
                    let _ = cmd_tx.send(ClientCommand::ListenFailed {
                        protocol,
                        reason: e.to_string(),
                    });
                }
            }
        }));
    }

    fn listen_ready(&mut self, protocol: &str) {
        if self.listeners.contains_key(protocol) {
            self.emit(RelayMessage::Listening { protocol: protocol.to_string() });
        } else {
            // Stopped before the handler install finished; undo it.
            let overlay = self.overlay.clone();
            let protocol = protocol.to_string();
            let _ = self
                .ops_tx
                .send(Box::pin(async move { overlay.remove_stream_handler(&protocol).await }));
        }
    }

    fn listen_failed(&mut self, protocol: String, reason: String) {
        self.listeners.remove(&protocol);
        warn!(client = self.client_id, protocol = %protocol, reason = %reason, "listen refused");
        self.emit(RelayMessage::ListenRefused { protocol, reason });
    }

    fn inbound_stream(&mut self, protocol: &str, stream: OverlayStream) {
        let frames = match self.listeners.get(protocol) {
            Some(lis) if !lis.is_closed() => lis.frames(),
            _ => {
                debug!(
                    client = self.client_id,
                    protocol,
                    peer = %stream.remote().short(),
                    "dropping inbound stream without listener"
                );
                return;
            }
        };

        let id = self.next_connection_id();
        let remote = stream.remote();
        info!(
            client = self.client_id,
            id = %id,
            protocol,
            peer = %remote.short(),
            "inbound connection accepted"
        );
        self.emit(RelayMessage::ListenerConnection {
            id,
            peer: remote.to_string(),
            protocol: protocol.to_string(),
        });

        let connection = Connection::spawn(
            id,
            protocol.to_string(),
            frames,
            Role::Listener,
            stream,
            self.outbound.clone(),
            self.cmd_tx.clone(),
        );
        if let Some(lis) = self.listeners.get_mut(protocol) {
            lis.insert(connection);
            self.listener_index.insert(id, protocol.to_string());
        }
    }

    // ------------------------------------------------------------------
    // Stop
    // ------------------------------------------------------------------

    fn stop(&mut self, protocol: &str, retain: bool) {
        if let Some(handle) = self.advertisements.remove(protocol) {
            handle.abort();
        }
        let Some(mut listener) = self.listeners.remove(protocol) else {
            return;
        };
        listener.mark_closed();

        let overlay = self.overlay.clone();
        let deregister = protocol.to_string();
        let _ = self
            .ops_tx
            .send(Box::pin(async move { overlay.remove_stream_handler(&deregister).await }));

        let mut kept = 0usize;
        for (id, mut connection) in listener.drain() {
            self.listener_index.remove(&id);
            if retain {
                connection.promote();
                self.forwarders.insert(id, connection);
                kept += 1;
            } else {
                connection.close();
            }
        }
        info!(
            client = self.client_id,
            protocol = %listener.protocol(),
            retain,
            retained = kept,
            "listener stopped"
        );
        self.emit(RelayMessage::ListenerClosed { protocol: protocol.to_string() });
    }

    // ------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------

    fn connect(&mut self, protocol: String, peer_spec: String, frames: bool, relay: bool) {
        if relay {
            self.emit(RelayMessage::ConnectionRefused {
                peer: peer_spec,
                protocol,
                reason: "relayed connections are not supported".to_string(),
            });
            return;
        }

        let spec = match parse_peer_spec(&peer_spec) {
            Ok(spec) => spec,
            Err(e) => {
                self.emit(RelayMessage::ConnectionRefused {
                    peer: peer_spec,
                    protocol,
                    reason: e.to_string(),
                });
                return;
            }
        };

        info!(
            client = self.client_id,
            protocol = %protocol,
            peer = %spec.peer.short(),
            addrs = spec.addrs.len(),
            "connect requested"
        );

        let overlay = self.overlay.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = overlay.connect(spec.peer, &spec.addrs).await {
                let _ = cmd_tx.send(ClientCommand::Refused {
                    peer: spec.peer.to_string(),
                    protocol,
                    reason: format!("could not connect to peer: {e}"),
                });
                return;
            }
            match overlay.open_stream(spec.peer, &protocol).await {
                Ok(stream) => {
                    let _ = cmd_tx.send(ClientCommand::Opened { protocol, frames, stream });
                }
                Err(e) => {
                    let _ = cmd_tx.send(ClientCommand::Refused {
                        peer: spec.peer.to_string(),
                        protocol,
                        reason: e.to_string(),
                    });
                }
            }
        });
    }

    fn opened(&mut self, protocol: String, frames: bool, stream: OverlayStream) {
        let id = self.next_connection_id();
        let remote = stream.remote();
        info!(
            client = self.client_id,
            id = %id,
            protocol = %protocol,
            peer = %remote.short(),
            "outbound connection established"
        );
        self.emit(RelayMessage::PeerConnection {
            id,
            peer: remote.to_string(),
            protocol: protocol.clone(),
        });

        let connection = Connection::spawn(
            id,
            protocol,
            frames,
            Role::Forwarder,
            stream,
            self.outbound.clone(),
            self.cmd_tx.clone(),
        );
        self.forwarders.insert(id, connection);
    }

    // ------------------------------------------------------------------
    // Close / data
    // ------------------------------------------------------------------

    fn close(&mut self, id: ConnectionId) {
        if let Some(protocol) = self.listener_index.remove(&id) {
            if let Some(lis) = self.listeners.get_mut(&protocol) {
                if let Some(mut connection) = lis.remove(id) {
                    debug!(
                        client = self.client_id,
                        id = %id,
                        peer = %connection.remote().short(),
                        "closing listener connection"
                    );
                    connection.close();
                }
            }
        } else if let Some(mut connection) = self.forwarders.remove(&id) {
            debug!(
                client = self.client_id,
                id = %id,
                peer = %connection.remote().short(),
                "closing peer connection"
            );
            connection.close();
        }
        // Unknown id: no-op; the id was already reaped.
    }

    fn data(&mut self, id: ConnectionId, data: Vec<u8>) {
        let connection = match self.forwarders.get(&id) {
            Some(c) => Some(c),
            None => self
                .listener_index
                .get(&id)
                .and_then(|protocol| self.listeners.get(protocol))
                .and_then(|lis| lis.get(id)),
        };

        match connection {
            Some(c) => {
                if !c.write_data(data) {
                    trace!(client = self.client_id, id = %id, "write to terminated stream dropped");
                }
            }
            None => {
                // Authoritative: confirms to the client that this id is gone.
                self.emit(RelayMessage::ConnectionClosed {
                    id,
                    reason: REASON_UNKNOWN_CONNECTION.to_string(),
                });
            }
        }
    }

    fn stream_closed(&mut self, id: ConnectionId, reason: String) {
        let owned = if let Some(protocol) = self.listener_index.remove(&id) {
            if let Some(lis) = self.listeners.get_mut(&protocol) {
                if let Some(mut connection) = lis.remove(id) {
                    connection.close();
                }
            }
            true
        } else if let Some(mut connection) = self.forwarders.remove(&id) {
            connection.close();
            true
        } else {
            false
        };

        // Already-reaped ids (explicit close racing the pump) emit nothing:
        // closing twice is equivalent to closing once.
        if owned {
            debug!(client = self.client_id, id = %id, reason = %reason, "connection ended");
            self.emit(RelayMessage::ConnectionClosed { id, reason });
        }
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    fn discovery_listen(&mut self, protocol: String, frames: bool, public: bool) {
        let tag = discovery_tag(public, frames, &protocol);
        if public {
            self.listen(protocol.clone(), frames);
        }

        if self.advertisements.contains_key(&protocol) {
            return;
        }
        info!(client = self.client_id, protocol = %protocol, tag = %tag, "advertising listener");

        let overlay = self.overlay.clone();
        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = overlay.advertise(&tag, DISCOVERY_TTL).await {
                    warn!(tag = %tag, error = %e, "advertisement failed");
                }
                tokio::time::sleep(DISCOVERY_REFRESH).await;
            }
        });
        self.advertisements.insert(protocol, handle);
    }

    fn discovery_connect(&mut self, protocol: String, frames: bool) {
        let overlay = self.overlay.clone();
        let cmd_tx = self.cmd_tx.clone();
        let client_id = self.client_id;
        tokio::spawn(async move {
            let direct_tag = discovery_tag(true, frames, &protocol);
            let indirect_tag = discovery_tag(false, frames, &protocol);

            for attempt in 1..=DISCOVERY_ATTEMPTS {
                match discovery_dial(overlay.as_ref(), &direct_tag, &indirect_tag, &protocol).await
                {
                    Ok(stream) => {
                        let _ = cmd_tx.send(ClientCommand::Opened { protocol, frames, stream });
                        return;
                    }
                    Err(e) => {
                        debug!(client = client_id, attempt, error = %e, "discovery connect attempt failed");
                    }
                }
            }
            let _ = cmd_tx.send(ClientCommand::Refused {
                peer: String::new(),
                protocol,
                reason: "could not connect to any discovered peer".to_string(),
            });
        });
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn teardown(&mut self) {
        for (_, handle) in self.advertisements.drain() {
            handle.abort();
        }
        let protocols: Vec<String> = self.listeners.keys().cloned().collect();
        for protocol in protocols {
            self.stop(&protocol, false);
        }
        for (_, mut connection) in self.forwarders.drain() {
            connection.close();
        }
    }
}


/// One discovery-connect attempt: walk direct peers in arrival order until
/// one accepts a stream, collecting indirect peers on the side. Indirect
/// routing (circuit relay / callback requests) is a future extension; the
/// collected peers are only reported in logs today.
async fn discovery_dial(
    overlay: &dyn Overlay,
    direct_tag: &str,
    indirect_tag: &str,
    protocol: &str,
) -> Result<OverlayStream, OverlayError> {
    let mut direct = overlay.find_peers(direct_tag).await?;
    let mut indirect = overlay.find_peers(indirect_tag).await?;
    let mut direct_open = true;
    let mut indirect_open = true;
    let mut indirect_found = 0usize;

    while direct_open || indirect_open {
        tokio::select! {
            found = direct.recv(), if direct_open => match found {
                Some(info) => {
                    trace!(peer = %info.peer.short(), tag = direct_tag, "direct peer discovered");
                    if let Err(e) = overlay.connect(info.peer, &info.addrs).await {
                        debug!(peer = %info.peer.short(), error = %e, "discovered peer unreachable");
                        continue;
                    }
                    match overlay.open_stream(info.peer, protocol).await {
                        Ok(stream) => return Ok(stream),
                        Err(e) => {
                            debug!(peer = %info.peer.short(), error = %e, "discovered peer refused stream");
                        }
                    }
                }
                None => direct_open = false,
            },
            found = indirect.recv(), if indirect_open => match found {
                Some(info) => {
                    trace!(peer = %info.peer.short(), tag = indirect_tag, "indirect peer discovered");
                    indirect_found += 1;
                }
                None => indirect_open = false,
            },
        }
    }

    if indirect_found > 0 {
        debug!(
            count = indirect_found,
            tag = indirect_tag,
            "indirect peers found but indirect routing is not implemented"
        );
    }
    Err(OverlayError::Discovery(protocol.to_string()))
}
