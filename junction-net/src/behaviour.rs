use std::time::Duration;

use libp2p::identity::Keypair;
use libp2p::swarm::NetworkBehaviour;
use libp2p::StreamProtocol;
use libp2p::{dcutr, gossipsub, identify, ping, relay, request_response};
use sha2::{Digest, Sha256};

use crate::codec::{DirectMessageCodec, FileExchangeCodec};
use crate::protocol::{
    CLIENT_VERSION, DIRECT_MESSAGE_PROTOCOL, FILE_EXCHANGE_PROTOCOL, IDENTIFY_PROTOCOL_VERSION,
};

/// Combined network behaviour for a junction peer.
#[derive(NetworkBehaviour)]
pub struct JunctionBehaviour {
    /// Circuit relay v2 client, for listening and dialing through relays.
    pub relay_client: relay::client::Behaviour,
    /// Hole punching: upgrades relayed connections to direct ones.
    pub dcutr: dcutr::Behaviour,
    /// Gossipsub for chat, file announcements and peer discovery records.
    pub gossipsub: gossipsub::Behaviour,
    /// Request-response for direct messages.
    pub direct_message: request_response::Behaviour<DirectMessageCodec>,
    /// Request-response for file exchange.
    pub file_exchange: request_response::Behaviour<FileExchangeCodec>,
    /// Identify, used to learn which protocols a peer supports.
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
}

/// Message identity used for gossipsub deduplication.
///
/// The identity is the raw 32-byte sha2-256 digest of the decimal sequence
/// number. It ignores payload and topic, so two deliveries of the same
/// sequence number are always the same message. Messages without a sequence
/// number hash the empty string.
pub fn message_identity(sequence_number: Option<u64>) -> gossipsub::MessageId {
    let seqno = sequence_number.map(|n| n.to_string()).unwrap_or_default();
    gossipsub::MessageId::from(Sha256::digest(seqno.as_bytes()).to_vec())
}

/// Build a JunctionBehaviour from a keypair and the relay client half
/// produced by the swarm builder.
///
/// Returns `Result<JunctionBehaviour, Box<dyn Error + Send + Sync>>` to conform
/// to the `TryIntoBehaviour` trait expected by `SwarmBuilder::with_behaviour`.
pub fn build_behaviour(
    keypair: &Keypair,
    relay_client: relay::client::Behaviour,
    request_timeout: Duration,
) -> Result<JunctionBehaviour, Box<dyn std::error::Error + Send + Sync>> {
    // --- Gossipsub ---
    let message_id_fn =
        |message: &gossipsub::Message| message_identity(message.sequence_number);

    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(1))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .message_id_fn(message_id_fn)
        .build()
        .map_err(|e| format!("gossipsub config: {}", e))?;

    let gossipsub = gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(keypair.clone()),
        gossipsub_config,
    )
    .map_err(|e| format!("gossipsub behaviour: {}", e))?;

    // --- Request-Response ---
    let rr_config = request_response::Config::default().with_request_timeout(request_timeout);

    let dm_protocol = StreamProtocol::try_from_owned(DIRECT_MESSAGE_PROTOCOL.to_string())
        .map_err(|e| format!("invalid protocol: {:?}", e))?;
    let direct_message = request_response::Behaviour::with_codec(
        DirectMessageCodec::default(),
        [(dm_protocol, request_response::ProtocolSupport::Full)],
        rr_config.clone(),
    );

    let file_protocol = StreamProtocol::try_from_owned(FILE_EXCHANGE_PROTOCOL.to_string())
        .map_err(|e| format!("invalid protocol: {:?}", e))?;
    let file_exchange = request_response::Behaviour::with_codec(
        FileExchangeCodec::default(),
        [(file_protocol, request_response::ProtocolSupport::Full)],
        rr_config,
    );

    // --- Identify ---
    let identify = identify::Behaviour::new(
        identify::Config::new(IDENTIFY_PROTOCOL_VERSION.to_string(), keypair.public())
            .with_agent_version(CLIENT_VERSION.to_string()),
    );

    Ok(JunctionBehaviour {
        relay_client,
        dcutr: dcutr::Behaviour::new(keypair.public().to_peer_id()),
        gossipsub,
        direct_message,
        file_exchange,
        identify,
        ping: ping::Behaviour::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_depends_only_on_sequence_number() {
        assert_eq!(message_identity(Some(42)), message_identity(Some(42)));
        assert_ne!(message_identity(Some(42)), message_identity(Some(43)));
    }

    #[test]
    fn test_identity_is_raw_sha256_of_decimal_string() {
        let id = message_identity(Some(7));
        assert_eq!(id.0.len(), 32);
        assert_eq!(id.0, Sha256::digest(b"7").to_vec());

        // sha256("1234567890")
        let id = message_identity(Some(1_234_567_890));
        assert_eq!(id.0[..4], [0xc7, 0x75, 0xe7, 0xb7]);
    }

    #[test]
    fn test_identity_ignores_payload() {
        let source = Some(libp2p::PeerId::random());
        let topic = gossipsub::IdentTopic::new("t").hash();
        let a = gossipsub::Message {
            source,
            data: b"first".to_vec(),
            sequence_number: Some(9),
            topic: topic.clone(),
        };
        let b = gossipsub::Message {
            source,
            data: b"second".to_vec(),
            sequence_number: Some(9),
            topic,
        };
        assert_eq!(
            message_identity(a.sequence_number),
            message_identity(b.sequence_number)
        );
    }
}
