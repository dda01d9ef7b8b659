//! # Relay
//!
//! Process-wide coordinator with an actor of its own: it owns the client
//! registry, the NAT reachability state, and the queue of actions deferred
//! until reachability is known. Control-channel servers hand it decoded
//! [`ClientMessage`]s; it routes them to the owning client session.
//!
//! ## NAT Gating
//!
//! Until the overlay reports a status other than `Unknown`, every operation
//! that would touch the overlay (`listen`, `connect`, `discovery-listen`,
//! `discovery-connect`, and the initial client-started notification) is
//! appended to a FIFO. The queue drains exactly once when the first real
//! status arrives; operations arriving afterwards run immediately. `close`
//! and `data` are never gated: they target connections that already exist.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::{ClientCommand, ClientSession};
use crate::messages::{ClientMessage, RelayMessage};
use crate::overlay::{NatStatus, Overlay, PeerId};

/// Command channel capacity for the relay actor.
const RELAY_COMMAND_CHANNEL_SIZE: usize = 256;


enum RelayCommand {
    Register {
        reply: oneshot::Sender<(u64, mpsc::UnboundedReceiver<RelayMessage>)>,
    },
    Message {
        client: u64,
        message: ClientMessage,
    },
    Disconnect {
        client: u64,
    },
    NatChanged {
        status: NatStatus,
        external: Option<String>,
    },
    Friends {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Quit,
}

enum Deferred {
    Started { client: u64 },
    Message { client: u64, message: ClientMessage },
}


// ============================================================================
// Handle
// ============================================================================

/// Handle to the relay actor. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    cmd_tx: mpsc::Sender<RelayCommand>,
}

impl Relay {
    /// Spawn the relay actor over an overlay host, plus the watcher that
    /// feeds NAT status observations into it.
    pub fn spawn(overlay: Arc<dyn Overlay>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(RELAY_COMMAND_CHANNEL_SIZE);

        let mut nat_rx = overlay.nat_status();
        let watcher_overlay = overlay.clone();
        let watcher_tx = cmd_tx.clone();
        tokio::spawn(async move {
            loop {
                let status = *nat_rx.borrow_and_update();
                let external = if status == NatStatus::Unknown {
                    None
                } else {
                    watcher_overlay.external_address().await
                };
                if watcher_tx.send(RelayCommand::NatChanged { status, external }).await.is_err() {
                    break;
                }
                if nat_rx.changed().await.is_err() {
                    break;
                }
            }
        });

        let actor = RelayActor {
            overlay,
            clients: HashMap::new(),
            next_client_id: 0,
            nat: NatStatus::Unknown,
            nat_resolved: false,
            deferred: VecDeque::new(),
            friends: HashSet::new(),
            external_address: None,
        };
        tokio::spawn(actor.run(cmd_rx));

        Self { cmd_tx }
    }

    /// Register a newly opened control channel. Returns the client id and
    /// the receiver feeding the channel's writer.
    pub async fn register_client(
        &self,
    ) -> Result<(u64, mpsc::UnboundedReceiver<RelayMessage>), &'static str> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RelayCommand::Register { reply: reply_tx })
            .await
            .map_err(|_| "relay actor closed")?;
        reply_rx.await.map_err(|_| "relay actor closed")
    }

    /// Route one decoded control message from a client.
    pub async fn client_message(
        &self,
        client: u64,
        message: ClientMessage,
    ) -> Result<(), &'static str> {
        self.cmd_tx
            .send(RelayCommand::Message { client, message })
            .await
            .map_err(|_| "relay actor closed")
    }

    /// Tear down a client session after its control channel closed.
    pub async fn client_closed(&self, client: u64) {
        let _ = self.cmd_tx.send(RelayCommand::Disconnect { client }).await;
    }

    /// Current friends allowlist.
    pub async fn friends(&self) -> Vec<PeerId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(RelayCommand::Friends { reply: reply_tx }).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Shut down the relay actor and every client session.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RelayCommand::Quit).await;
    }
}


// ============================================================================
// Actor
// ============================================================================

struct RelayActor {
    overlay: Arc<dyn Overlay>,
    clients: HashMap<u64, ClientSession>,
    next_client_id: u64,
    nat: NatStatus,
    nat_resolved: bool,
    deferred: VecDeque<Deferred>,
    friends: HashSet<PeerId>,
    external_address: Option<String>,
}

impl RelayActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RelayCommand>) {
        info!(peer = %self.overlay.local_peer(), "relay started");
        loop {
            match cmd_rx.recv().await {
                Some(RelayCommand::Register { reply }) => {
                    let _ = reply.send(self.register());
                }
                Some(RelayCommand::Message { client, message }) => {
                    self.handle_message(client, message);
                }
                Some(RelayCommand::Disconnect { client }) => {
                    self.disconnect(client);
                }
                Some(RelayCommand::NatChanged { status, external }) => {
                    self.nat_changed(status, external);
                }
                Some(RelayCommand::Friends { reply }) => {
                    let _ = reply.send(self.friends.iter().copied().collect());
                }
                Some(RelayCommand::Quit) | None => {
                    debug!("relay actor shutting down");
                    break;
                }
            }
        }
        for (_, session) in self.clients.drain() {
            session.send(ClientCommand::Shutdown);
        }
    }

    fn register(&mut self) -> (u64, mpsc::UnboundedReceiver<RelayMessage>) {
        self.next_client_id += 1;
        let client_id = self.next_client_id;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let session = ClientSession::spawn(client_id, self.overlay.clone(), outbound_tx);

        if self.nat_resolved {
            session.send(ClientCommand::NatKnown { status: self.nat });
        } else {
            self.deferred.push_back(Deferred::Started { client: client_id });
        }

        self.clients.insert(client_id, session);
        info!(client = client_id, total = self.clients.len(), "client registered");
        (client_id, outbound_rx)
    }

    fn handle_message(&mut self, client: u64, message: ClientMessage) {
        if Self::gated(&message) && !self.nat_resolved {
            debug!(client, "operation deferred until NAT status is known");
            self.deferred.push_back(Deferred::Message { client, message });
            return;
        }
        self.dispatch(client, message);
    }

    /// Operations requiring overlay activity wait for reachability; `close`
    /// and `data` target established connections and pass through, as does
    /// the relay-level `friends` update.
    fn gated(message: &ClientMessage) -> bool {
        matches!(
            message,
            ClientMessage::Listen { .. }
                | ClientMessage::Connect { .. }
                | ClientMessage::DiscoveryListen { .. }
                | ClientMessage::DiscoveryConnect { .. }
        )
    }

    fn dispatch(&mut self, client: u64, message: ClientMessage) {
        let public = self.nat == NatStatus::Public;
        match message {
            ClientMessage::Friends { add, remove } => self.update_friends(add, remove),
            message => {
                let Some(session) = self.clients.get(&client) else {
                    debug!(client, "message for departed client dropped");
                    return;
                };
                let command = match message {
                    ClientMessage::Listen { protocol, frames } => {
                        ClientCommand::Listen { protocol, frames }
                    }
                    ClientMessage::Stop { protocol, retain_connections } => {
                        ClientCommand::Stop { protocol, retain: retain_connections }
                    }
                    ClientMessage::Connect { protocol, peer, frames, relay } => {
                        ClientCommand::Connect { protocol, peer_spec: peer, frames, relay }
                    }
                    ClientMessage::Close { id } => ClientCommand::Close { id },
                    ClientMessage::Data { id, data } => {
                        ClientCommand::Data { id, data: data.into_inner() }
                    }
                    ClientMessage::DiscoveryListen { protocol, frames } => {
                        ClientCommand::DiscoveryListen { protocol, frames, public }
                    }
                    ClientMessage::DiscoveryConnect { protocol, frames } => {
                        ClientCommand::DiscoveryConnect { protocol, frames }
                    }
                    // Handled by the outer match.
                    ClientMessage::Friends { .. } => return,
                };
                session.send(command);
            }
        }
    }

    fn disconnect(&mut self, client: u64) {
        self.deferred.retain(|action| match action {
            Deferred::Started { client: c } | Deferred::Message { client: c, .. } => *c != client,
        });
        if let Some(session) = self.clients.remove(&client) {
            session.send(ClientCommand::Shutdown);
            info!(client, total = self.clients.len(), "client departed");
        }
    }

    fn nat_changed(&mut self, status: NatStatus, external: Option<String>) {
        if let Some(addr) = external {
            if self.external_address.as_deref() != Some(addr.as_str()) {
                info!(address = %addr, "external address observed");
                self.external_address = Some(addr);
            }
        }
        if status == NatStatus::Unknown {
            return;
        }

        self.nat = status;
        if self.nat_resolved {
            debug!(status = %status, "NAT status updated");
            return;
        }

        self.nat_resolved = true;
        info!(status = %status, deferred = self.deferred.len(), "NAT status resolved");
        let deferred: Vec<Deferred> = self.deferred.drain(..).collect();
        for action in deferred {
            match action {
                Deferred::Started { client } => {
                    if let Some(session) = self.clients.get(&client) {
                        session.send(ClientCommand::NatKnown { status });
                    }
                }
                Deferred::Message { client, message } => self.dispatch(client, message),
            }
        }
    }

    fn update_friends(&mut self, add: Vec<String>, remove: Vec<String>) {
        let parse = |raw: &[String]| -> Option<Vec<PeerId>> {
            let mut peers = Vec::with_capacity(raw.len());
            for entry in raw {
                match PeerId::from_hex(entry) {
                    Ok(peer) => peers.push(peer),
                    Err(e) => {
                        warn!(peer = %entry, error = %e, "dropping friends update with invalid peer id");
                        return None;
                    }
                }
            }
            Some(peers)
        };
        let (Some(added), Some(removed)) = (parse(&add), parse(&remove)) else {
            return;
        };
        for peer in added {
            self.friends.insert(peer);
        }
        for peer in removed {
            self.friends.remove(&peer);
        }
        debug!(total = self.friends.len(), "friends updated");
    }
}
