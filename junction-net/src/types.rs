//! Data model shared by the node, its channels and the wire codecs.

use std::time::SystemTime;

use libp2p::core::ConnectedPoint;
use libp2p::swarm::ConnectionId;
use libp2p::{Multiaddr, PeerId};

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open connection to a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    pub remote_peer: PeerId,
    pub remote_address: Multiaddr,
    pub direction: Direction,
    pub opened_at: SystemTime,
}

impl Connection {
    /// Build a connection record from the swarm's view of an endpoint.
    pub fn from_endpoint(id: ConnectionId, remote_peer: PeerId, endpoint: &ConnectedPoint) -> Self {
        let (remote_address, direction) = match endpoint {
            ConnectedPoint::Dialer { address, .. } => (address.clone(), Direction::Outbound),
            ConnectedPoint::Listener { send_back_addr, .. } => {
                (send_back_addr.clone(), Direction::Inbound)
            }
        };
        Self {
            id,
            remote_peer,
            remote_address,
            direction,
            opened_at: SystemTime::now(),
        }
    }

    /// Deduplicated protocol names of the remote address, in address order.
    pub fn protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for proto in self.remote_address.iter() {
            let name = proto.tag().to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Whether the connection runs over a relay circuit.
    pub fn is_relayed(&self) -> bool {
        self.remote_address
            .iter()
            .any(|p| matches!(p, libp2p::multiaddr::Protocol::P2pCircuit))
    }
}

/// Events re-exposed from the transport stack, in the order the stack raised them.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerDiscovered {
        peer_id: PeerId,
        addresses: Vec<Multiaddr>,
    },
    ConnectionOpened(Connection),
    ConnectionClosed(Connection),
    SelfAddressChanged {
        addresses: Vec<Multiaddr>,
    },
}

/// An inbound gossipsub message as seen by the broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub origin_peer: Option<PeerId>,
    pub sequence_number: Option<u64>,
    pub signed: bool,
}

impl BroadcastMessage {
    /// Payload decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// An inbound direct message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMessage {
    pub from: PeerId,
    pub mime_type: String,
    pub data: String,
}

/// A file held for serving over the file exchange protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: String,
    pub body: Vec<u8>,
    pub sender_peer: PeerId,
}

// ─── Wire types ─────────────────────────────────────────────────────────────

/// Direct message request written once per stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMessageRequest {
    pub client_version: String,
    /// Milliseconds since the unix epoch at the sender.
    pub timestamp: i64,
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectMessageStatus {
    Ok,
    Error,
}

impl DirectMessageStatus {
    /// Protobuf enum value on the wire.
    pub fn code(&self) -> u64 {
        match self {
            DirectMessageStatus::Ok => 200,
            DirectMessageStatus::Error => 500,
        }
    }

    /// Anything other than 200, including an omitted status, is an error.
    pub fn from_code(code: u64) -> Self {
        if code == 200 {
            DirectMessageStatus::Ok
        } else {
            DirectMessageStatus::Error
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMessageResponse {
    pub client_version: String,
    pub timestamp: i64,
    pub status: DirectMessageStatus,
}

/// File id requested over the file exchange protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequest {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileResponse {
    Found(Vec<u8>),
    /// Sent by closing the stream without writing a frame.
    NotFound,
}
