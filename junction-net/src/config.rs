use std::time::Duration;

use libp2p::Multiaddr;

use crate::protocol::{
    BOOTSTRAP_PEER_IDS, DEFAULT_DISCOVERY_INTERVAL, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_REQUEST_TIMEOUT, DELEGATED_ROUTING_ENDPOINT, QUIC_LISTEN_ADDR,
    WEBRTC_DIRECT_LISTEN_ADDR,
};

/// Configuration for a peer node.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Direct addresses to listen on.
    pub listen_addrs: Vec<Multiaddr>,
    /// Peer ids (base58) of the relays whose circuit addresses are resolved at startup.
    pub bootstrap_peer_ids: Vec<String>,
    /// Delegated routing HTTP endpoint.
    pub routing_endpoint: String,
    /// Whether to resolve and listen on relay circuit addresses.
    pub resolve_relays: bool,
    /// Timeout for each delegated routing query.
    pub routing_timeout: Duration,
    /// Maximum number of tracked connections.
    pub max_connections: usize,
    /// Optional keypair seed (32 bytes). If None, generates random.
    pub keypair_seed: Option<[u8; 32]>,
    /// Interval between pubsub peer discovery advertisements.
    pub discovery_interval: Duration,
    /// Timeout for direct message and file requests.
    pub request_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen_addrs: default_listen_addrs(),
            bootstrap_peer_ids: BOOTSTRAP_PEER_IDS.iter().map(|s| s.to_string()).collect(),
            routing_endpoint: DELEGATED_ROUTING_ENDPOINT.to_string(),
            resolve_relays: true,
            routing_timeout: Duration::from_secs(10),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            keypair_seed: None,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl PeerConfig {
    /// A config listening on an ephemeral localhost TCP port with relay
    /// resolution disabled. Used for local meshes and tests.
    pub fn local() -> Self {
        Self {
            listen_addrs: vec![localhost_tcp_addr()],
            bootstrap_peer_ids: Vec::new(),
            resolve_relays: false,
            ..Self::default()
        }
    }

    pub fn with_keypair_seed(mut self, seed: [u8; 32]) -> Self {
        self.keypair_seed = Some(seed);
        self
    }
}

/// WebRTC-direct and QUIC on all interfaces with ephemeral ports.
pub fn default_listen_addrs() -> Vec<Multiaddr> {
    [WEBRTC_DIRECT_LISTEN_ADDR, QUIC_LISTEN_ADDR]
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
}

fn localhost_tcp_addr() -> Multiaddr {
    Multiaddr::empty()
        .with(libp2p::multiaddr::Protocol::Ip4([127, 0, 0, 1].into()))
        .with(libp2p::multiaddr::Protocol::Tcp(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_listens_on_webrtc_and_quic() {
        let config = PeerConfig::default();
        assert_eq!(config.listen_addrs.len(), 2);
        assert!(config.listen_addrs[0].to_string().ends_with("/webrtc-direct"));
        assert!(config.listen_addrs[1].to_string().ends_with("/quic-v1"));
        assert!(config.resolve_relays);
        assert_eq!(config.bootstrap_peer_ids.len(), BOOTSTRAP_PEER_IDS.len());
    }

    #[test]
    fn test_local_config() {
        let config = PeerConfig::local().with_keypair_seed([3u8; 32]);
        assert_eq!(config.listen_addrs[0].to_string(), "/ip4/127.0.0.1/tcp/0");
        assert!(!config.resolve_relays);
        assert_eq!(config.keypair_seed, Some([3u8; 32]));
    }
}
