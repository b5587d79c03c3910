use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use libp2p::core::muxing::StreamMuxerBox;
use libp2p::gossipsub::IdentTopic;
use libp2p::identity::Keypair;
use libp2p::{noise, tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder, Transport};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, warn};

use crate::behaviour::{build_behaviour, JunctionBehaviour};
use crate::broadcast::{BroadcastChannel, BroadcastDispatcher};
use crate::config::PeerConfig;
use crate::direct_message::DirectMessageChannel;
use crate::error::NetworkError;
use crate::event_loop::{call, Command, EventLoop, Shared};
use crate::file_exchange::{FileExchangeChannel, FileStore};
use crate::peer_manager::PeerManager;
use crate::protocol::{
    CHAT_FILE_TOPIC, CHAT_TOPIC, IDLE_CONNECTION_TIMEOUT, PUBSUB_PEER_DISCOVERY_TOPIC,
    SEEN_CACHE_CAPACITY,
};
use crate::relay_resolver::{
    parse_bootstrap_peers, resolve_relay_addrs, DelegatedRoutingClient, RoutingClient,
};
use crate::types::{Connection, NodeEvent};

const COMMAND_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 256;
const MESSAGE_CHANNEL_SIZE: usize = 1024;

/// Observable lifecycle state of a [`PeerNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Stopped => "stopped",
            NodeState::Starting => "starting",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
        }
    }
}

enum Lifecycle {
    Stopped,
    Starting,
    Running {
        handle: NodeHandle,
        task: JoinHandle<()>,
    },
    Stopping,
}

impl Lifecycle {
    fn state(&self) -> NodeState {
        match self {
            Lifecycle::Stopped => NodeState::Stopped,
            Lifecycle::Starting => NodeState::Starting,
            Lifecycle::Running { .. } => NodeState::Running,
            Lifecycle::Stopping => NodeState::Stopping,
        }
    }
}

/// Resets the lifecycle to `Stopped` when dropped while still armed, so an
/// abandoned start or stop never leaves the node stuck in a transition.
struct Rollback<'a> {
    lifecycle: &'a Mutex<Lifecycle>,
    task: Option<AbortHandle>,
    armed: bool,
}

impl<'a> Rollback<'a> {
    fn new(lifecycle: &'a Mutex<Lifecycle>, task: Option<AbortHandle>) -> Self {
        Self {
            lifecycle,
            task,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(task) = &self.task {
            task.abort();
        }
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) = Lifecycle::Stopped;
    }
}

/// Owns the network stack of one peer and drives it through
/// `stopped -> starting -> running -> stopping -> stopped`.
///
/// The identity is fixed at construction and survives restarts.
pub struct PeerNode {
    config: PeerConfig,
    keypair: Keypair,
    files: Arc<FileStore>,
    peers: Arc<RwLock<PeerManager>>,
    routing: Option<Arc<dyn RoutingClient>>,
    lifecycle: Mutex<Lifecycle>,
}

impl PeerNode {
    /// Create a stopped node. `files` is the table offered files are served from.
    pub fn new(config: PeerConfig, files: Arc<FileStore>) -> Result<Self, NetworkError> {
        let keypair = if let Some(seed) = &config.keypair_seed {
            let mut seed_bytes = *seed;
            Keypair::ed25519_from_bytes(&mut seed_bytes).map_err(|e| NetworkError::Startup {
                reason: format!("invalid keypair seed: {}", e),
            })?
        } else {
            Keypair::generate_ed25519()
        };

        let peers = Arc::new(RwLock::new(PeerManager::new(config.max_connections)));
        Ok(Self {
            config,
            keypair,
            files,
            peers,
            routing: None,
            lifecycle: Mutex::new(Lifecycle::Stopped),
        })
    }

    /// Use `client` instead of the delegated routing HTTP service to resolve relays.
    pub fn with_routing_client(mut self, client: Arc<dyn RoutingClient>) -> Self {
        self.routing = Some(client);
        self
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.keypair.public().to_peer_id()
    }

    pub fn state(&self) -> NodeState {
        self.lock_lifecycle().state()
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the node and return its handle.
    ///
    /// Starting a running node returns the existing handle. Starting while a
    /// start or stop is in progress fails with `InvalidState`. Dropping the
    /// returned future before it resolves leaves the node stopped.
    pub async fn start(&self) -> Result<NodeHandle, NetworkError> {
        {
            let mut lifecycle = self.lock_lifecycle();
            if let Lifecycle::Running { handle, .. } = &*lifecycle {
                return Ok(handle.clone());
            }
            let state = lifecycle.state();
            if state != NodeState::Stopped {
                return Err(NetworkError::InvalidState {
                    action: "start".to_string(),
                    state: state.as_str().to_string(),
                });
            }
            *lifecycle = Lifecycle::Starting;
        }

        let rollback = Rollback::new(&self.lifecycle, None);
        let (handle, task) = self.launch().await?;
        rollback.disarm();

        *self.lock_lifecycle() = Lifecycle::Running {
            handle: handle.clone(),
            task,
        };
        Ok(handle)
    }

    /// Stop the node: leave every topic, fail pending requests, close every
    /// connection and listener. Stopping a stopped node is a no-op.
    pub async fn stop(&self) -> Result<(), NetworkError> {
        let (handle, task) = {
            let mut lifecycle = self.lock_lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Running { handle, task } => (handle, task),
                Lifecycle::Starting => {
                    *lifecycle = Lifecycle::Starting;
                    return Err(NetworkError::InvalidState {
                        action: "stop".to_string(),
                        state: NodeState::Starting.as_str().to_string(),
                    });
                }
                other => {
                    *lifecycle = other;
                    return Ok(());
                }
            }
        };

        // Abandoning the stop halfway aborts the loop instead of leaving it
        // orphaned behind a `Stopping` state.
        let rollback = Rollback::new(&self.lifecycle, Some(task.abort_handle()));

        info!(peer_id = %handle.local_peer_id, "stopping node");
        // A closed channel means the loop already exited.
        let _ = handle.commands.send(Command::Shutdown).await;
        if let Err(e) = task.await {
            warn!("event loop task failed: {}", e);
        }

        rollback.disarm();
        *self.lock_lifecycle() = Lifecycle::Stopped;
        info!("node stopped");
        Ok(())
    }

    async fn launch(&self) -> Result<(NodeHandle, JoinHandle<()>), NetworkError> {
        let local_peer_id = self.local_peer_id();
        let mut swarm = build_swarm(self.keypair.clone(), &self.config).await?;

        let topics: Vec<IdentTopic> = [CHAT_TOPIC, CHAT_FILE_TOPIC, PUBSUB_PEER_DISCOVERY_TOPIC]
            .into_iter()
            .map(IdentTopic::new)
            .collect();
        for topic in &topics {
            swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(topic)
                .map_err(|e| NetworkError::Startup {
                    reason: format!("subscribe to {}: {}", topic, e),
                })?;
        }

        let mut listening = 0;
        for addr in &self.config.listen_addrs {
            match swarm.listen_on(addr.clone()) {
                Ok(_) => listening += 1,
                Err(e) => warn!(%addr, "cannot listen: {}", e),
            }
        }
        // Circuit listeners only request a reservation; they never count as bound.
        if listening == 0 {
            return Err(NetworkError::Startup {
                reason: "no direct listen address could be bound".to_string(),
            });
        }

        let relay_addrs = self.relay_listen_addrs().await;
        for addr in &relay_addrs {
            if let Err(e) = swarm.listen_on(addr.clone()) {
                warn!(%addr, "cannot listen on relay circuit: {}", e);
            }
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (broadcast_tx, _) = broadcast::channel(MESSAGE_CHANNEL_SIZE);
        let (direct_tx, _) = broadcast::channel(MESSAGE_CHANNEL_SIZE);
        let self_addrs = Arc::new(RwLock::new(Vec::new()));

        let broadcast = BroadcastChannel::new(command_tx.clone(), broadcast_tx.clone());
        let handle = NodeHandle {
            local_peer_id,
            commands: command_tx.clone(),
            peers: self.peers.clone(),
            self_addrs: self_addrs.clone(),
            events: event_tx.clone(),
            direct_messages: DirectMessageChannel::new(
                command_tx.clone(),
                self.peers.clone(),
                direct_tx.clone(),
            ),
            files: FileExchangeChannel::new(
                command_tx,
                self.files.clone(),
                broadcast.clone(),
                local_peer_id,
            ),
            broadcast,
        };

        let event_loop = EventLoop::new(
            swarm,
            self.keypair.public(),
            command_rx,
            Shared {
                peers: self.peers.clone(),
                self_addrs,
                files: self.files.clone(),
                events: event_tx,
                direct_messages: direct_tx,
            },
            BroadcastDispatcher::new(SEEN_CACHE_CAPACITY, broadcast_tx),
            topics,
            self.config.discovery_interval,
        );
        let task = tokio::spawn(event_loop.run());

        info!(
            %local_peer_id,
            listeners = listening,
            relays = relay_addrs.len(),
            "node started"
        );
        Ok((handle, task))
    }

    async fn relay_listen_addrs(&self) -> Vec<Multiaddr> {
        if !self.config.resolve_relays {
            return Vec::new();
        }
        let bootstrap = parse_bootstrap_peers(&self.config.bootstrap_peer_ids);
        if bootstrap.is_empty() {
            return Vec::new();
        }

        let client: Arc<dyn RoutingClient> = match &self.routing {
            Some(client) => client.clone(),
            None => match DelegatedRoutingClient::new(
                &self.config.routing_endpoint,
                self.config.routing_timeout,
            ) {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    warn!("relay resolution disabled: {}", e);
                    return Vec::new();
                }
            },
        };
        resolve_relay_addrs(client.as_ref(), &bootstrap).await
    }
}

/// Build the swarm: TCP, QUIC, WebRTC-direct, DNS, WebSocket and relay
/// transports, secured with noise and multiplexed with yamux where the
/// transport does not do it itself.
async fn build_swarm(
    keypair: Keypair,
    config: &PeerConfig,
) -> Result<Swarm<JunctionBehaviour>, NetworkError> {
    let certificate = libp2p_webrtc::tokio::Certificate::generate(&mut rand::thread_rng())
        .map_err(|e| NetworkError::Startup {
            reason: format!("webrtc certificate: {}", e),
        })?;
    let request_timeout = config.request_timeout;

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| NetworkError::Startup {
            reason: format!("tcp transport: {}", e),
        })?
        .with_quic()
        .with_other_transport(|key| {
            libp2p_webrtc::tokio::Transport::new(key.clone(), certificate)
                .map(|(peer_id, conn), _| (peer_id, StreamMuxerBox::new(conn)))
        })
        .map_err(|e| NetworkError::Startup {
            reason: format!("webrtc transport: {}", e),
        })?
        .with_dns()
        .map_err(|e| NetworkError::Startup {
            reason: format!("dns transport: {}", e),
        })?
        .with_websocket(noise::Config::new, yamux::Config::default)
        .await
        .map_err(|e| NetworkError::Startup {
            reason: format!("websocket transport: {}", e),
        })?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| NetworkError::Startup {
            reason: format!("relay client: {}", e),
        })?
        .with_behaviour(|key, relay_client| build_behaviour(key, relay_client, request_timeout))
        .map_err(|e| NetworkError::Startup {
            reason: format!("behaviour: {}", e),
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    Ok(swarm)
}

/// Cheap-to-clone handle to a running node.
///
/// Every operation fails with `NotRunning` (or returns `false`) once the node
/// it came from has stopped.
#[derive(Clone)]
pub struct NodeHandle {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    peers: Arc<RwLock<PeerManager>>,
    self_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    events: broadcast::Sender<NodeEvent>,
    broadcast: BroadcastChannel,
    direct_messages: DirectMessageChannel,
    files: FileExchangeChannel,
}

impl NodeHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Whether the event loop behind this handle is still running.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Snapshot of the open connections, oldest first.
    pub async fn connections(&self) -> Vec<Connection> {
        self.peers.read().await.connections()
    }

    /// Listen and confirmed external addresses of this node.
    pub async fn self_addresses(&self) -> Vec<Multiaddr> {
        self.self_addrs.read().await.clone()
    }

    /// Subscribe to discovery, connection and address events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn broadcast(&self) -> &BroadcastChannel {
        &self.broadcast
    }

    pub fn direct_messages(&self) -> &DirectMessageChannel {
        &self.direct_messages
    }

    pub fn files(&self) -> &FileExchangeChannel {
        &self.files
    }

    /// Dial `address` and wait until the connection is established.
    pub async fn connect(&self, address: Multiaddr) -> Result<PeerId, NetworkError> {
        call(&self.commands, |reply| Command::Dial { address, reply }).await?
    }

    /// Close every connection to `peer`. Returns false if none was open.
    pub async fn disconnect(&self, peer: PeerId) -> Result<bool, NetworkError> {
        call(&self.commands, |reply| Command::Disconnect { peer, reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay_resolver::RelayCandidate;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Routing service that never answers.
    struct SilentRouting;

    #[async_trait]
    impl RoutingClient for SilentRouting {
        async fn get_peers(&self, _peer_id: &PeerId) -> Result<Vec<RelayCandidate>, NetworkError> {
            futures::future::pending::<Result<Vec<RelayCandidate>, NetworkError>>().await
        }
    }

    struct FixedRouting(RelayCandidate);

    #[async_trait]
    impl RoutingClient for FixedRouting {
        async fn get_peers(&self, _peer_id: &PeerId) -> Result<Vec<RelayCandidate>, NetworkError> {
            Ok(vec![self.0.clone()])
        }
    }

    fn local_node(seed: Option<[u8; 32]>) -> PeerNode {
        let mut config = PeerConfig::local();
        config.keypair_seed = seed;
        PeerNode::new(config, Arc::new(FileStore::new())).unwrap()
    }

    #[test]
    fn test_seed_gives_stable_identity() {
        let a = local_node(Some([42u8; 32]));
        let b = local_node(Some([42u8; 32]));
        assert_eq!(a.local_peer_id(), b.local_peer_id());
        assert_ne!(a.local_peer_id(), local_node(None).local_peer_id());
    }

    #[tokio::test]
    async fn test_new_node_is_stopped() {
        let node = local_node(None);
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let node = local_node(None);
        node.stop().await.unwrap();
        node.stop().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_returns_existing_handle() {
        let node = local_node(None);
        let first = node.start().await.unwrap();
        let second = node.start().await.unwrap();
        assert_eq!(first.local_peer_id(), second.local_peer_id());
        assert_eq!(node.state(), NodeState::Running);

        node.stop().await.unwrap();
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(!first.is_running());
        assert!(matches!(
            first.disconnect(PeerId::random()).await,
            Err(NetworkError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let node = local_node(None);
        let first = node.start().await.unwrap();
        node.stop().await.unwrap();
        let second = node.start().await.unwrap();
        assert!(second.is_running());
        assert!(!first.is_running());
        assert_eq!(first.local_peer_id(), second.local_peer_id());
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_without_any_listener() {
        let mut config = PeerConfig::local();
        config.listen_addrs = vec!["/memory/1234".parse().unwrap()];
        let node = PeerNode::new(config, Arc::new(FileStore::new())).unwrap();
        assert!(matches!(
            node.start().await,
            Err(NetworkError::Startup { .. })
        ));
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_abandoned_start_leaves_node_stopped() {
        let mut config = PeerConfig::local();
        config.resolve_relays = true;
        config.bootstrap_peer_ids = vec![PeerId::random().to_string()];
        let node = PeerNode::new(config, Arc::new(FileStore::new()))
            .unwrap()
            .with_routing_client(Arc::new(SilentRouting));

        let attempt = tokio::time::timeout(Duration::from_millis(500), node.start()).await;
        assert!(attempt.is_err());
        assert_eq!(node.state(), NodeState::Stopped);
        node.stop().await.unwrap();

        // A second start runs again rather than failing with InvalidState.
        let retry = tokio::time::timeout(Duration::from_millis(500), node.start()).await;
        assert!(retry.is_err());
        assert_eq!(node.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_relay_circuits_alone_do_not_count_as_listening() {
        let relay = PeerId::random();
        let mut config = PeerConfig::local();
        config.listen_addrs = vec!["/memory/1234".parse().unwrap()];
        config.resolve_relays = true;
        config.bootstrap_peer_ids = vec![relay.to_string()];
        let candidate = RelayCandidate {
            peer_id: relay,
            addresses: vec!["/ip4/192.0.2.1/tcp/443/tls/ws".parse().unwrap()],
        };
        let node = PeerNode::new(config, Arc::new(FileStore::new()))
            .unwrap()
            .with_routing_client(Arc::new(FixedRouting(candidate)));

        assert!(matches!(
            node.start().await,
            Err(NetworkError::Startup { .. })
        ));
        assert_eq!(node.state(), NodeState::Stopped);
    }
}
