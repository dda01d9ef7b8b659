//! One registered application protocol and the inbound connections it owns.
//!
//! A listener's close semantics live in the client actor (closing touches
//! the forwarder map and the reverse index); this type only owns the
//! per-protocol state.

use std::collections::HashMap;

use crate::connection::Connection;
use crate::messages::ConnectionId;

pub struct Listener {
    protocol: String,
    frames: bool,
    connections: HashMap<ConnectionId, Connection>,
    closed: bool,
}

impl Listener {
    pub fn new(protocol: String, frames: bool) -> Self {
        Self { protocol, frames, connections: HashMap::new(), closed: false }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn frames(&self) -> bool {
        self.frames
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Once closed, no new connections are accepted for this listener.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn insert(&mut self, connection: Connection) {
        self.connections.insert(connection.id(), connection);
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (ConnectionId, Connection)> + '_ {
        self.connections.drain()
    }
}
