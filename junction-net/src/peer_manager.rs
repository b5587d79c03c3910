use std::collections::HashMap;

use libp2p::swarm::ConnectionId;
use libp2p::PeerId;

use crate::types::Connection;

/// Tracks open connections and which peers speak the direct message protocol.
///
/// Only the event loop writes to this table; handles read it through a lock.
pub struct PeerManager {
    connections: HashMap<ConnectionId, Connection>,
    /// `true` when a peer advertised or was observed using the direct message
    /// protocol, `false` when identify listed its protocols without it.
    dm_capable: HashMap<PeerId, bool>,
    max_connections: usize,
}

impl PeerManager {
    /// Create a new PeerManager with a maximum connection limit.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            dm_capable: HashMap::new(),
            max_connections,
        }
    }

    /// Record an open connection. Returns false if the connection limit is reached.
    pub fn add_connection(&mut self, connection: Connection) -> bool {
        if !self.connections.contains_key(&connection.id) && self.is_full() {
            return false;
        }
        self.connections.insert(connection.id, connection);
        true
    }

    /// Remove a connection record, returning it if it was tracked.
    pub fn remove_connection(&mut self, id: &ConnectionId) -> Option<Connection> {
        self.connections.remove(id)
    }

    /// Whether at least one connection to `peer` is open.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connections.values().any(|c| &c.remote_peer == peer)
    }

    /// Snapshot of every open connection, oldest first.
    pub fn connections(&self) -> Vec<Connection> {
        let mut all: Vec<Connection> = self.connections.values().cloned().collect();
        all.sort_by_key(|c| c.opened_at);
        all
    }

    /// Whether the peer manager has reached its connection limit.
    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Number of currently open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Record the protocol list a peer reported through identify.
    pub fn set_protocols<'a, I>(&mut self, peer: PeerId, protocols: I, dm_protocol: &str)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let supported = protocols.into_iter().any(|p| p == dm_protocol);
        self.dm_capable.insert(peer, supported);
    }

    /// Record that a peer opened a direct message stream to us.
    pub fn mark_dm_capable(&mut self, peer: PeerId) {
        self.dm_capable.insert(peer, true);
    }

    /// Record that a peer refused to negotiate the direct message protocol.
    pub fn mark_dm_unsupported(&mut self, peer: PeerId) {
        self.dm_capable.insert(peer, false);
    }

    /// Known direct message support for `peer`; `None` until the peer has
    /// been identified or observed.
    pub fn dm_capability(&self, peer: &PeerId) -> Option<bool> {
        self.dm_capable.get(peer).copied()
    }

    /// Forget all connections. Capability knowledge is kept across restarts.
    pub fn clear_connections(&mut self) {
        self.connections.clear();
    }
}
