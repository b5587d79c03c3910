//! Resolution of relay-circuit listen addresses from well-known bootstrap peers.

use std::time::Duration;

use async_trait::async_trait;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::NetworkError;

/// Peer record returned by the routing service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCandidate {
    pub peer_id: PeerId,
    pub addresses: Vec<Multiaddr>,
}

/// A source of peer records for a peer id.
#[async_trait]
pub trait RoutingClient: Send + Sync {
    /// Return every record the service knows for `peer_id`, in service order.
    async fn get_peers(&self, peer_id: &PeerId) -> Result<Vec<RelayCandidate>, NetworkError>;
}

/// Client for the delegated routing v1 HTTP API (`/routing/v1/peers/{id}`).
pub struct DelegatedRoutingClient {
    endpoint: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct PeersResponse {
    #[serde(rename = "Peers", default)]
    peers: Option<Vec<PeerJson>>,
}

#[derive(Debug, Deserialize)]
struct PeerJson {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Addrs", default)]
    addrs: Option<Vec<String>>,
}

impl DelegatedRoutingClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, NetworkError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NetworkError::Discovery {
                reason: format!("http client: {}", e),
            })?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn peers_url(&self, peer_id: &PeerId) -> String {
        format!("{}/routing/v1/peers/{}", self.endpoint, peer_id)
    }
}

#[async_trait]
impl RoutingClient for DelegatedRoutingClient {
    async fn get_peers(&self, peer_id: &PeerId) -> Result<Vec<RelayCandidate>, NetworkError> {
        let url = self.peers_url(peer_id);
        debug!(%url, "querying delegated routing");

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| NetworkError::Discovery {
                reason: format!("GET {}: {}", url, e),
            })?
            .error_for_status()
            .map_err(|e| NetworkError::Discovery {
                reason: format!("GET {}: {}", url, e),
            })?;

        let bytes = response.bytes().await.map_err(|e| NetworkError::Discovery {
            reason: format!("read {}: {}", url, e),
        })?;
        let body: PeersResponse =
            serde_json::from_slice(&bytes).map_err(|e| NetworkError::Discovery {
                reason: format!("decode {}: {}", url, e),
            })?;

        Ok(parse_peers(body))
    }
}

/// Convert a routing response into candidates. Records with an invalid id
/// and addresses that fail to parse are logged and skipped.
fn parse_peers(body: PeersResponse) -> Vec<RelayCandidate> {
    body.peers
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| {
            let peer_id = p
                .id
                .parse::<PeerId>()
                .map_err(|e| warn!("invalid peer id '{}' in routing record: {}", p.id, e))
                .ok()?;
            let addresses = p
                .addrs
                .unwrap_or_default()
                .iter()
                .filter_map(|s| {
                    s.parse::<Multiaddr>()
                        .map_err(|e| warn!("invalid multiaddr '{}': {}", s, e))
                        .ok()
                })
                .collect();
            Some(RelayCandidate { peer_id, addresses })
        })
        .collect()
}

/// Whether an address can host a relay reservation: it must carry tls, ws and
/// a non-loopback ip4 host.
pub fn is_relay_capable(addr: &Multiaddr) -> bool {
    let mut tls = false;
    let mut ws = false;
    let mut ip4 = false;
    for proto in addr.iter() {
        match proto {
            Protocol::Tls => tls = true,
            Protocol::Ws(_) => ws = true,
            Protocol::Ip4(ip) => {
                if ip.is_loopback() {
                    return false;
                }
                ip4 = true;
            }
            _ => {}
        }
    }
    tls && ws && ip4
}

/// Rewrite a relay address into a circuit listen address:
/// `<address>/p2p/<relay>/p2p-circuit`.
pub fn circuit_listen_addr(addr: &Multiaddr, relay: PeerId) -> Multiaddr {
    addr.clone()
        .with(Protocol::P2p(relay))
        .with(Protocol::P2pCircuit)
}

/// Derive circuit listen addresses from a candidate's advertised addresses.
pub fn relay_listen_addrs(candidate: &RelayCandidate) -> Vec<Multiaddr> {
    candidate
        .addresses
        .iter()
        .filter(|a| is_relay_capable(a))
        .map(|a| circuit_listen_addr(a, candidate.peer_id))
        .collect()
}

/// Query the routing service for every bootstrap peer and return the circuit
/// listen addresses of all usable relay addresses, in bootstrap order.
///
/// A failed query skips that bootstrap peer; when every query fails the
/// result is empty.
pub async fn resolve_relay_addrs(
    client: &dyn RoutingClient,
    bootstrap_peers: &[PeerId],
) -> Vec<Multiaddr> {
    let lookups = bootstrap_peers.iter().map(|peer| client.get_peers(peer));
    let results = futures::future::join_all(lookups).await;

    let mut listen_addrs = Vec::new();
    for (peer, result) in bootstrap_peers.iter().zip(results) {
        match result {
            Ok(records) => match records.into_iter().next() {
                Some(candidate) => listen_addrs.extend(relay_listen_addrs(&candidate)),
                None => debug!(%peer, "no routing record for bootstrap peer"),
            },
            Err(e) => warn!(%peer, "bootstrap peer lookup failed: {}", e),
        }
    }

    info!(count = listen_addrs.len(), "resolved relay listen addresses");
    listen_addrs
}

/// Parse bootstrap peer id strings. Invalid entries are logged and skipped.
pub fn parse_bootstrap_peers(ids: &[String]) -> Vec<PeerId> {
    ids.iter()
        .filter_map(|s| {
            s.parse::<PeerId>()
                .map_err(|e| warn!("invalid bootstrap peer id '{}': {}", s, e))
                .ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticRouting {
        records: HashMap<PeerId, Vec<RelayCandidate>>,
    }

    #[async_trait]
    impl RoutingClient for StaticRouting {
        async fn get_peers(&self, peer_id: &PeerId) -> Result<Vec<RelayCandidate>, NetworkError> {
            self.records
                .get(peer_id)
                .cloned()
                .ok_or_else(|| NetworkError::Discovery {
                    reason: "unreachable".to_string(),
                })
        }
    }

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_only_non_loopback_tls_ws_ip4_survives() {
        let relay = PeerId::random();
        let candidate = RelayCandidate {
            peer_id: relay,
            addresses: vec![
                addr("/ip4/147.75.87.27/tcp/443/tls/ws"),
                addr("/ip4/127.0.0.1/tcp/443/tls/ws"),
                addr("/ip4/147.75.87.27/udp/4001/quic-v1"),
            ],
        };
        let client = StaticRouting {
            records: HashMap::from([(relay, vec![candidate])]),
        };

        let addrs = resolve_relay_addrs(&client, &[relay]).await;
        assert_eq!(
            addrs,
            vec![addr(&format!(
                "/ip4/147.75.87.27/tcp/443/tls/ws/p2p/{}/p2p-circuit",
                relay
            ))]
        );
    }

    #[tokio::test]
    async fn test_failed_lookup_is_skipped() {
        let good = PeerId::random();
        let bad = PeerId::random();
        let client = StaticRouting {
            records: HashMap::from([(
                good,
                vec![RelayCandidate {
                    peer_id: good,
                    addresses: vec![addr("/ip4/10.0.0.1/tcp/443/tls/ws")],
                }],
            )]),
        };

        let addrs = resolve_relay_addrs(&client, &[bad, good]).await;
        assert_eq!(addrs.len(), 1);
    }

    #[tokio::test]
    async fn test_all_lookups_fail_yields_empty() {
        let client = StaticRouting {
            records: HashMap::new(),
        };
        let addrs = resolve_relay_addrs(&client, &[PeerId::random(), PeerId::random()]).await;
        assert!(addrs.is_empty());
    }

    #[tokio::test]
    async fn test_first_record_wins() {
        let relay = PeerId::random();
        let first = RelayCandidate {
            peer_id: relay,
            addresses: vec![addr("/ip4/10.0.0.1/tcp/443/tls/ws")],
        };
        let second = RelayCandidate {
            peer_id: relay,
            addresses: vec![addr("/ip4/10.0.0.2/tcp/443/tls/ws")],
        };
        let client = StaticRouting {
            records: HashMap::from([(relay, vec![first, second])]),
        };

        let addrs = resolve_relay_addrs(&client, &[relay]).await;
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].to_string().starts_with("/ip4/10.0.0.1/"));
    }

    #[test]
    fn test_dns_address_without_ip4_rejected() {
        assert!(!is_relay_capable(&addr("/dns4/relay.example.com/tcp/443/tls/ws")));
    }

    #[test]
    fn test_parse_routing_response() {
        let relay = PeerId::random();
        let json = format!(
            r#"{{"Peers":[{{"Schema":"peer","ID":"{}","Addrs":["/ip4/1.2.3.4/tcp/443/tls/ws","garbage"]}}]}}"#,
            relay
        );
        let body: PeersResponse = serde_json::from_str(&json).unwrap();
        let peers = parse_peers(body);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, relay);
        assert_eq!(peers[0].addresses.len(), 1);
    }

    #[test]
    fn test_parse_null_peers() {
        let body: PeersResponse = serde_json::from_str(r#"{"Peers":null}"#).unwrap();
        assert!(parse_peers(body).is_empty());
    }

    #[test]
    fn test_parse_bootstrap_peers_skips_invalid() {
        let ids = vec![PeerId::random().to_string(), "not-a-peer".to_string()];
        assert_eq!(parse_bootstrap_peers(&ids).len(), 1);
    }
}
