//! Point-to-point text messages over a dedicated request-response protocol.

use std::sync::Arc;

use libp2p::PeerId;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

use crate::event_loop::{call, Command};
use crate::peer_manager::PeerManager;
use crate::protocol::{CLIENT_VERSION, MIME_TEXT_PLAIN};
use crate::types::{DirectMessage, DirectMessageRequest};

/// Handle for sending and receiving direct messages.
#[derive(Clone)]
pub struct DirectMessageChannel {
    commands: mpsc::Sender<Command>,
    peers: Arc<RwLock<PeerManager>>,
    messages: broadcast::Sender<DirectMessage>,
}

impl DirectMessageChannel {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        peers: Arc<RwLock<PeerManager>>,
        messages: broadcast::Sender<DirectMessage>,
    ) -> Self {
        Self {
            commands,
            peers,
            messages,
        }
    }

    /// Whether `peer` advertised the protocol through identify or has sent
    /// us a direct message. Answered from the local capability table.
    pub async fn is_dm_capable(&self, peer: &PeerId) -> bool {
        self.peers.read().await.dm_capability(peer) == Some(true)
    }

    /// Send `text` to `peer` as a `text/plain` message.
    ///
    /// Returns false when the peer is known not to support the protocol, is
    /// unreachable, answers with an error status, or the node is not running.
    pub async fn send(&self, peer: PeerId, text: &str) -> bool {
        if self.peers.read().await.dm_capability(&peer) == Some(false) {
            debug!(%peer, "peer does not support direct messages");
            return false;
        }

        let request = DirectMessageRequest {
            client_version: CLIENT_VERSION.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            mime_type: MIME_TEXT_PLAIN.to_string(),
            data: text.to_string(),
        };

        match call(&self.commands, |reply| Command::SendDirect {
            peer,
            request,
            reply,
        })
        .await
        {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!(%peer, "direct message not sent: {}", e);
                false
            }
        }
    }

    /// Receive every inbound direct message, once per completed stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DirectMessage> {
        self.messages.subscribe()
    }
}
