//! Peer connectivity and messaging for junction peers.
//!
//! Built on libp2p: relay addresses are resolved from well-known bootstrap
//! peers through delegated routing, discovered peers are dialed over direct
//! transports, and three application channels run on top of the swarm:
//! gossipsub broadcast for chat and file announcements, a direct message
//! protocol, and a request-response file exchange protocol.

pub mod behaviour;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod dialer;
pub mod direct_message;
pub mod discovery;
pub mod error;
mod event_loop;
pub mod file_exchange;
pub mod node;
pub mod peer_manager;
pub mod protocol;
pub mod relay_resolver;
pub mod types;
pub mod wire;

pub use libp2p::{Multiaddr, PeerId};

pub use broadcast::{BroadcastChannel, PublishReceipt};
pub use config::PeerConfig;
pub use direct_message::DirectMessageChannel;
pub use error::NetworkError;
pub use file_exchange::{FileAnnouncement, FileExchangeChannel, FileStore};
pub use node::{NodeHandle, NodeState, PeerNode};
pub use types::{BroadcastMessage, Connection, Direction, DirectMessage, FileRecord, NodeEvent};
