use std::time::Duration;

/// Gossipsub topic carrying public chat text.
pub const CHAT_TOPIC: &str = "universal-connectivity";

/// Gossipsub topic carrying file announcements (the payload is the file id).
pub const CHAT_FILE_TOPIC: &str = "universal-connectivity-file";

/// Gossipsub topic carrying peer records for pubsub peer discovery.
pub const PUBSUB_PEER_DISCOVERY_TOPIC: &str = "universal-connectivity-browser-peer-discovery";

/// Direct message protocol.
pub const DIRECT_MESSAGE_PROTOCOL: &str = "/universal-connectivity/dm/1.0.0";

/// File exchange protocol.
pub const FILE_EXCHANGE_PROTOCOL: &str = "/universal-connectivity-file/1";

/// Identify protocol version advertised by this node.
pub const IDENTIFY_PROTOCOL_VERSION: &str = "/junction/1.0.0";

/// Mime type of plain text direct messages.
pub const MIME_TEXT_PLAIN: &str = "text/plain";

/// Client version sent in direct message metadata and as identify agent.
pub const CLIENT_VERSION: &str = concat!("junction/", env!("CARGO_PKG_VERSION"));

/// Well-known bootstrap peers whose relay addresses are resolved at startup.
pub const BOOTSTRAP_PEER_IDS: &[&str] = &[
    "12D3KooWFhXabKDwALpzqMbto94sB7rvmZ6M28hs9Y9xSopDKwQr",
    "12D3KooWBbkCD5MpJhMc1mfPAVGEyVkQnyxPKGS7AHwDqQM2JUsk",
];

/// Delegated routing endpoint queried for bootstrap peer records.
pub const DELEGATED_ROUTING_ENDPOINT: &str = "https://delegated-ipfs.dev";

/// Direct listen address (WebRTC-direct, hole-punch capable).
pub const WEBRTC_DIRECT_LISTEN_ADDR: &str = "/ip4/0.0.0.0/udp/0/webrtc-direct";

/// Direct listen address for QUIC.
pub const QUIC_LISTEN_ADDR: &str = "/ip4/0.0.0.0/udp/0/quic-v1";

/// Maximum size of a direct message frame.
pub const MAX_DIRECT_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum size of a file exchange frame.
pub const MAX_FILE_SIZE: usize = 64 * 1024 * 1024;

/// Number of message identities remembered for broadcast deduplication.
pub const SEEN_CACHE_CAPACITY: usize = 4096;

/// Default interval between pubsub peer discovery advertisements.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);

/// Default timeout for direct message and file exchange requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum number of simultaneous connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 128;

/// Idle connection timeout applied to the swarm.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::{Multiaddr, PeerId, StreamProtocol};

    #[test]
    fn test_protocol_names_are_valid_stream_protocols() {
        assert!(StreamProtocol::try_from_owned(DIRECT_MESSAGE_PROTOCOL.to_string()).is_ok());
        assert!(StreamProtocol::try_from_owned(FILE_EXCHANGE_PROTOCOL.to_string()).is_ok());
    }

    #[test]
    fn test_listen_addrs_parse() {
        assert!(WEBRTC_DIRECT_LISTEN_ADDR.parse::<Multiaddr>().is_ok());
        assert!(QUIC_LISTEN_ADDR.parse::<Multiaddr>().is_ok());
    }

    #[test]
    fn test_bootstrap_ids_parse() {
        for id in BOOTSTRAP_PEER_IDS {
            assert!(id.parse::<PeerId>().is_ok(), "invalid bootstrap id {}", id);
        }
    }

    #[test]
    fn test_topics_are_distinct() {
        assert_ne!(CHAT_TOPIC, CHAT_FILE_TOPIC);
        assert_ne!(CHAT_TOPIC, PUBSUB_PEER_DISCOVERY_TOPIC);
        assert_ne!(CHAT_FILE_TOPIC, PUBSUB_PEER_DISCOVERY_TOPIC);
    }
}
