//! Opportunistic dialing of discovered peers over WebRTC addresses.

use std::collections::{HashMap, VecDeque};

use libp2p::multiaddr::Protocol;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::ConnectionId;
use libp2p::{Multiaddr, PeerId};
use tracing::{debug, info};

/// One dial the event loop should hand to the swarm.
#[derive(Debug)]
pub struct DialAttempt {
    pub peer: PeerId,
    pub address: Multiaddr,
    pub opts: DialOpts,
}

struct DialState {
    remaining: VecDeque<Multiaddr>,
    current: ConnectionId,
}

/// Plans sequential dial attempts, one address at a time, per discovered peer.
///
/// The planner never touches the swarm: it returns [`DialAttempt`]s and is
/// told about outcomes through [`Dialer::on_dial_failed`] and
/// [`Dialer::on_connected`].
pub struct Dialer {
    local_peer_id: PeerId,
    in_flight: HashMap<PeerId, DialState>,
}

/// The address to dial for one advertised address, or `None` if it is not a
/// WebRTC address.
///
/// Only WebRTC addresses are dialed. `webrtc-direct` addresses are dialed as
/// they are. Browser peers advertise `/…/p2p-circuit/webrtc/p2p/<peer>`; the
/// native stack has no browser-to-browser WebRTC transport, so those are
/// dialed through the relay circuit with the `/webrtc` segment removed, and
/// dcutr then tries to upgrade the relayed connection to a direct one. A bare
/// `/webrtc` address with no circuit to signal over cannot be dialed.
pub fn webrtc_dial_target(addr: &Multiaddr) -> Option<Multiaddr> {
    let mut circuit = false;
    let mut webrtc = false;
    let mut webrtc_direct = false;
    for proto in addr.iter() {
        match proto {
            Protocol::P2pCircuit => circuit = true,
            Protocol::WebRTC => webrtc = true,
            Protocol::WebRTCDirect => webrtc_direct = true,
            _ => {}
        }
    }

    if webrtc && circuit {
        Some(
            addr.iter()
                .filter(|p| !matches!(p, Protocol::WebRTC))
                .collect(),
        )
    } else if webrtc_direct && !circuit {
        Some(addr.clone())
    } else {
        None
    }
}

impl Dialer {
    pub fn new(local_peer_id: PeerId) -> Self {
        Self {
            local_peer_id,
            in_flight: HashMap::new(),
        }
    }

    /// Handle a discovery event. Returns the first dial to perform, or `None`
    /// when the peer is ourselves, already connected, already being dialed,
    /// or advertised no direct address.
    pub fn on_discovered(
        &mut self,
        peer: PeerId,
        addresses: &[Multiaddr],
        connected: bool,
    ) -> Option<DialAttempt> {
        if peer == self.local_peer_id || connected || self.in_flight.contains_key(&peer) {
            return None;
        }

        let mut remaining: VecDeque<Multiaddr> = VecDeque::new();
        for target in addresses.iter().filter_map(webrtc_dial_target) {
            if !remaining.contains(&target) {
                remaining.push_back(target);
            }
        }

        let Some(address) = remaining.pop_front() else {
            debug!(%peer, "no webrtc address to dial");
            return None;
        };

        let attempt = dial_attempt(peer, address);
        self.in_flight.insert(
            peer,
            DialState {
                remaining,
                current: attempt.opts.connection_id(),
            },
        );
        Some(attempt)
    }

    /// Handle a failed outgoing connection. If it was one of our attempts,
    /// returns the next address to try, or `None` once the list is exhausted.
    pub fn on_dial_failed(&mut self, peer: PeerId, connection_id: ConnectionId) -> Option<DialAttempt> {
        let state = self.in_flight.get_mut(&peer)?;
        if state.current != connection_id {
            return None;
        }

        match state.remaining.pop_front() {
            Some(address) => {
                let attempt = dial_attempt(peer, address);
                state.current = attempt.opts.connection_id();
                Some(attempt)
            }
            None => {
                info!(%peer, "all webrtc addresses failed, leaving peer undialed");
                self.in_flight.remove(&peer);
                None
            }
        }
    }

    /// A connection to `peer` was established; stop dialing it.
    pub fn on_connected(&mut self, peer: &PeerId) {
        self.in_flight.remove(peer);
    }

    pub fn is_dialing(&self, peer: &PeerId) -> bool {
        self.in_flight.contains_key(peer)
    }

    /// Drop every in-flight plan.
    pub fn clear(&mut self) {
        self.in_flight.clear();
    }
}

fn dial_attempt(peer: PeerId, address: Multiaddr) -> DialAttempt {
    debug!(%peer, %address, "dialing discovered peer");
    let opts = DialOpts::peer_id(peer)
        .addresses(vec![address.clone()])
        .build();
    DialAttempt {
        peer,
        address,
        opts,
    }
}
