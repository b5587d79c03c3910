//! The single task that owns the swarm. Handles talk to it over a command
//! channel and read shared state through locks it alone writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic, TopicHash};
use libp2p::request_response::{self, OutboundFailure, OutboundRequestId};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::identity::PublicKey;
use libp2p::{dcutr, identify, relay, Multiaddr, PeerId, Swarm};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::behaviour::{JunctionBehaviour, JunctionBehaviourEvent};
use crate::broadcast::BroadcastDispatcher;
use crate::dialer::{DialAttempt, Dialer};
use crate::discovery::{decode_peer_record, encode_peer_record};
use crate::error::NetworkError;
use crate::file_exchange::{serve_request, FileStore};
use crate::peer_manager::PeerManager;
use crate::protocol::{
    CLIENT_VERSION, DIRECT_MESSAGE_PROTOCOL, MIME_TEXT_PLAIN, PUBSUB_PEER_DISCOVERY_TOPIC,
};
use crate::types::{
    Connection, DirectMessage, DirectMessageRequest, DirectMessageResponse, DirectMessageStatus,
    FileRequest, FileResponse, NodeEvent,
};

type FetchReply = oneshot::Sender<Result<Vec<u8>, NetworkError>>;
type DialReply = oneshot::Sender<Result<PeerId, NetworkError>>;

pub(crate) enum Command {
    Publish {
        topic: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<usize, NetworkError>>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<()>,
    },
    SendDirect {
        peer: PeerId,
        request: DirectMessageRequest,
        reply: oneshot::Sender<bool>,
    },
    FetchFile {
        peer: PeerId,
        request: FileRequest,
        reply: FetchReply,
    },
    Dial {
        address: Multiaddr,
        reply: DialReply,
    },
    Disconnect {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Send a command and wait for its reply.
pub(crate) async fn call<T>(
    commands: &mpsc::Sender<Command>,
    make: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T, NetworkError> {
    let (reply, rx) = oneshot::channel();
    commands
        .send(make(reply))
        .await
        .map_err(|_| NetworkError::NotRunning)?;
    rx.await.map_err(|_| NetworkError::Channel {
        reason: "event loop dropped the reply".to_string(),
    })
}

/// Everything the loop shares with the handles of one running node.
pub(crate) struct Shared {
    pub peers: Arc<RwLock<PeerManager>>,
    pub self_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    pub files: Arc<FileStore>,
    pub events: broadcast::Sender<NodeEvent>,
    pub direct_messages: broadcast::Sender<DirectMessage>,
}

pub(crate) struct EventLoop {
    swarm: Swarm<JunctionBehaviour>,
    public_key: PublicKey,
    commands: mpsc::Receiver<Command>,
    shared: Shared,
    dialer: Dialer,
    dispatcher: BroadcastDispatcher,
    topics: Vec<IdentTopic>,
    discovery_topic: TopicHash,
    discovery_interval: Duration,
    pending_direct: HashMap<OutboundRequestId, oneshot::Sender<bool>>,
    pending_files: HashMap<OutboundRequestId, (String, FetchReply)>,
    pending_dials: HashMap<ConnectionId, (Multiaddr, DialReply)>,
}

impl EventLoop {
    pub(crate) fn new(
        swarm: Swarm<JunctionBehaviour>,
        public_key: PublicKey,
        commands: mpsc::Receiver<Command>,
        shared: Shared,
        dispatcher: BroadcastDispatcher,
        topics: Vec<IdentTopic>,
        discovery_interval: Duration,
    ) -> Self {
        let dialer = Dialer::new(*swarm.local_peer_id());
        Self {
            swarm,
            public_key,
            commands,
            shared,
            dialer,
            dispatcher,
            topics,
            discovery_topic: IdentTopic::new(PUBSUB_PEER_DISCOVERY_TOPIC).hash(),
            discovery_interval,
            pending_direct: HashMap::new(),
            pending_files: HashMap::new(),
            pending_dials: HashMap::new(),
        }
    }

    /// Run until a shutdown command arrives or every handle is dropped.
    pub(crate) async fn run(mut self) {
        let mut advertise = tokio::time::interval(self.discovery_interval);
        advertise.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event).await,
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                _ = advertise.tick() => self.advertise().await,
            }
        }

        self.teardown().await;
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<JunctionBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event).await,
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                self.dialer.on_connected(&peer_id);
                let pending = self.pending_dials.remove(&connection_id);

                let connection = Connection::from_endpoint(connection_id, peer_id, &endpoint);
                if !self.shared.peers.write().await.add_connection(connection.clone()) {
                    warn!(%peer_id, "connection limit reached, closing connection");
                    self.swarm.close_connection(connection_id);
                    if let Some((address, reply)) = pending {
                        let _ = reply.send(Err(NetworkError::Dial {
                            address: address.to_string(),
                            reason: "connection limit reached".to_string(),
                        }));
                    }
                    return;
                }
                if let Some((_, reply)) = pending {
                    let _ = reply.send(Ok(peer_id));
                }
                debug!(
                    %peer_id,
                    address = %connection.remote_address,
                    direction = %connection.direction,
                    "connection opened"
                );
                let _ = self
                    .shared
                    .events
                    .send(NodeEvent::ConnectionOpened(connection));
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                cause,
                ..
            } => {
                debug!(%peer_id, ?cause, "connection closed");
                let closed = self
                    .shared
                    .peers
                    .write()
                    .await
                    .remove_connection(&connection_id);
                if let Some(connection) = closed {
                    let _ = self
                        .shared
                        .events
                        .send(NodeEvent::ConnectionClosed(connection));
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                if let Some((address, reply)) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(NetworkError::Dial {
                        address: address.to_string(),
                        reason: error.to_string(),
                    }));
                    return;
                }
                let Some(peer) = peer_id else {
                    return;
                };
                if self.dialer.is_dialing(&peer) {
                    warn!(%peer, "dial attempt failed: {}", error);
                }
                if let Some(attempt) = self.dialer.on_dial_failed(peer, connection_id) {
                    self.dial(attempt);
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "listening on new address");
                self.refresh_self_addresses().await;
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                debug!(%address, "listen address expired");
                self.refresh_self_addresses().await;
            }
            SwarmEvent::ExternalAddrConfirmed { address } => {
                debug!(%address, "external address confirmed");
                self.refresh_self_addresses().await;
            }
            SwarmEvent::ExternalAddrExpired { address } => {
                debug!(%address, "external address expired");
                self.refresh_self_addresses().await;
            }
            SwarmEvent::ListenerError { error, .. } => {
                warn!("listener error: {}", error);
            }
            other => {
                debug!(?other, "other swarm event");
            }
        }
    }

    async fn handle_behaviour_event(&mut self, event: JunctionBehaviourEvent) {
        match event {
            JunctionBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            }) => {
                if message.topic == self.discovery_topic {
                    self.handle_peer_record(&message.data);
                } else {
                    debug!(
                        %propagation_source,
                        topic = %message.topic,
                        "received broadcast message"
                    );
                    self.dispatcher.dispatch(message);
                }
            }
            JunctionBehaviourEvent::Gossipsub(event) => {
                debug!(?event, "gossipsub event");
            }
            JunctionBehaviourEvent::DirectMessage(event) => {
                self.handle_direct_message_event(event).await;
            }
            JunctionBehaviourEvent::FileExchange(event) => {
                self.handle_file_exchange_event(event).await;
            }
            JunctionBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                debug!(
                    %peer_id,
                    agent = %info.agent_version,
                    protocols = info.protocols.len(),
                    "identified peer"
                );
                self.shared.peers.write().await.set_protocols(
                    peer_id,
                    info.protocols.iter().map(AsRef::<str>::as_ref),
                    DIRECT_MESSAGE_PROTOCOL,
                );
            }
            JunctionBehaviourEvent::RelayClient(
                relay::client::Event::ReservationReqAccepted { relay_peer_id, .. },
            ) => {
                info!(%relay_peer_id, "relay reservation accepted");
            }
            JunctionBehaviourEvent::RelayClient(event) => {
                debug!(?event, "relay client event");
            }
            JunctionBehaviourEvent::Dcutr(dcutr::Event {
                remote_peer_id,
                result,
            }) => match result {
                Ok(_) => info!(peer = %remote_peer_id, "hole punch upgraded relayed connection"),
                Err(e) => debug!(peer = %remote_peer_id, "hole punch failed: {}", e),
            },
            _ => {}
        }
    }

    async fn handle_direct_message_event(
        &mut self,
        event: request_response::Event<DirectMessageRequest, DirectMessageResponse>,
    ) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    self.shared.peers.write().await.mark_dm_capable(peer);

                    let status = if request.mime_type == MIME_TEXT_PLAIN {
                        DirectMessageStatus::Ok
                    } else {
                        warn!(%peer, mime = %request.mime_type, "unsupported direct message type");
                        DirectMessageStatus::Error
                    };
                    if self
                        .swarm
                        .behaviour_mut()
                        .direct_message
                        .send_response(
                            channel,
                            DirectMessageResponse {
                                client_version: CLIENT_VERSION.to_string(),
                                timestamp: chrono::Utc::now().timestamp_millis(),
                                status,
                            },
                        )
                        .is_err()
                    {
                        debug!(%peer, "direct message stream closed before response");
                    }

                    if status == DirectMessageStatus::Ok {
                        debug!(
                            %peer,
                            client = %request.client_version,
                            timestamp = request.timestamp,
                            "received direct message"
                        );
                        let _ = self.shared.direct_messages.send(DirectMessage {
                            from: peer,
                            mime_type: request.mime_type,
                            data: request.data,
                        });
                    }
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_direct.remove(&request_id) {
                        let _ = reply.send(response.status == DirectMessageStatus::Ok);
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                warn!(%peer, "direct message failed: {}", error);
                if matches!(error, OutboundFailure::UnsupportedProtocols) {
                    self.shared.peers.write().await.mark_dm_unsupported(peer);
                }
                if let Some(reply) = self.pending_direct.remove(&request_id) {
                    let _ = reply.send(false);
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(%peer, "inbound direct message failed: {}", error);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    async fn handle_file_exchange_event(
        &mut self,
        event: request_response::Event<FileRequest, FileResponse>,
    ) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    debug!(%peer, id = %request.id, "file requested");
                    let response = serve_request(&self.shared.files, &request).await;
                    if self
                        .swarm
                        .behaviour_mut()
                        .file_exchange
                        .send_response(channel, response)
                        .is_err()
                    {
                        debug!(%peer, id = %request.id, "file stream closed before response");
                    }
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some((id, reply)) = self.pending_files.remove(&request_id) {
                        let result = match response {
                            FileResponse::Found(body) => Ok(body),
                            FileResponse::NotFound => Err(NetworkError::FileNotFound { id }),
                        };
                        let _ = reply.send(result);
                    }
                }
            },
            request_response::Event::OutboundFailure {
                request_id, error, ..
            } => {
                if let Some((id, reply)) = self.pending_files.remove(&request_id) {
                    let _ = reply.send(Err(NetworkError::FileFetch {
                        id,
                        reason: error.to_string(),
                    }));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(%peer, "inbound file request failed: {}", error);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Publish {
                topic,
                payload,
                reply,
            } => {
                let _ = reply.send(self.publish(&topic, payload));
            }
            Command::Unsubscribe { topic, reply } => {
                let topic = IdentTopic::new(topic);
                let _ = self.swarm.behaviour_mut().gossipsub.unsubscribe(&topic);
                self.topics.retain(|t| t.hash() != topic.hash());
                let _ = reply.send(());
            }
            Command::SendDirect {
                peer,
                request,
                reply,
            } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .direct_message
                    .send_request(&peer, request);
                self.pending_direct.insert(request_id, reply);
            }
            Command::FetchFile {
                peer,
                request,
                reply,
            } => {
                let id = request.id.clone();
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .file_exchange
                    .send_request(&peer, request);
                self.pending_files.insert(request_id, (id, reply));
            }
            Command::Dial { address, reply } => {
                let opts = DialOpts::from(address.clone());
                let connection_id = opts.connection_id();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        self.pending_dials.insert(connection_id, (address, reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(NetworkError::Dial {
                            address: address.to_string(),
                            reason: e.to_string(),
                        }));
                    }
                }
            }
            Command::Disconnect { peer, reply } => {
                let _ = reply.send(self.swarm.disconnect_peer_id(peer).is_ok());
            }
            // Handled by the run loop.
            Command::Shutdown => {}
        }
    }

    /// Publish on a topic and count the peers subscribed to it. Duplicate
    /// publishes and publishes with no peers succeed with zero recipients.
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<usize, NetworkError> {
        let hash = IdentTopic::new(topic).hash();
        let gossipsub = &mut self.swarm.behaviour_mut().gossipsub;
        match gossipsub.publish(hash.clone(), payload) {
            Ok(_) => Ok(gossipsub
                .all_peers()
                .filter(|(_, topics)| topics.contains(&&hash))
                .count()),
            Err(gossipsub::PublishError::Duplicate)
            | Err(gossipsub::PublishError::InsufficientPeers) => {
                debug!(%topic, "publish reached no peers");
                Ok(0)
            }
            Err(e) => Err(NetworkError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn dial(&mut self, attempt: DialAttempt) {
        let DialAttempt {
            peer,
            address,
            opts,
        } = attempt;
        let connection_id = opts.connection_id();
        if let Err(e) = self.swarm.dial(opts) {
            warn!(%peer, %address, "dial failed: {}", e);
            // The swarm reports no error event for a rejected dial.
            if let Some(next) = self.dialer.on_dial_failed(peer, connection_id) {
                self.dial(next);
            }
        }
    }

    fn handle_peer_record(&mut self, data: &[u8]) {
        let (peer, addresses) = match decode_peer_record(data) {
            Ok(record) => record,
            Err(e) => {
                debug!("ignoring malformed peer record: {}", e);
                return;
            }
        };
        if peer == *self.swarm.local_peer_id() {
            return;
        }

        debug!(%peer, count = addresses.len(), "peer discovered");
        for address in &addresses {
            self.swarm.add_peer_address(peer, address.clone());
        }
        let _ = self.shared.events.send(NodeEvent::PeerDiscovered {
            peer_id: peer,
            addresses: addresses.clone(),
        });

        let connected = self.swarm.is_connected(&peer);
        if let Some(attempt) = self.dialer.on_discovered(peer, &addresses, connected) {
            self.dial(attempt);
        }
    }

    /// Publish our peer record on the discovery topic.
    async fn advertise(&mut self) {
        let addrs = self.shared.self_addrs.read().await.clone();
        if addrs.is_empty() {
            return;
        }
        let data = encode_peer_record(&self.public_key, &addrs);
        if let Err(e) = self.publish(PUBSUB_PEER_DISCOVERY_TOPIC, data) {
            debug!("peer record not published: {}", e);
        }
    }

    async fn refresh_self_addresses(&mut self) {
        let mut addrs: Vec<Multiaddr> = Vec::new();
        for addr in self.swarm.listeners().chain(self.swarm.external_addresses()) {
            if !addrs.contains(addr) {
                addrs.push(addr.clone());
            }
        }
        info!(addresses = ?addrs, "self addresses changed");
        *self.shared.self_addrs.write().await = addrs.clone();
        let _ = self
            .shared
            .events
            .send(NodeEvent::SelfAddressChanged { addresses: addrs });
    }

    /// Leave every topic, fail every pending request and forget connections.
    /// Dropping the swarm afterwards closes listeners, connections and streams.
    async fn teardown(mut self) {
        for topic in std::mem::take(&mut self.topics) {
            let _ = self.swarm.behaviour_mut().gossipsub.unsubscribe(&topic);
        }

        self.dialer.clear();
        self.dispatcher.reset();

        for (_, reply) in self.pending_direct.drain() {
            let _ = reply.send(false);
        }
        for (_, (id, reply)) in self.pending_files.drain() {
            let _ = reply.send(Err(NetworkError::FileFetch {
                id,
                reason: "node stopped".to_string(),
            }));
        }
        for (_, (address, reply)) in self.pending_dials.drain() {
            let _ = reply.send(Err(NetworkError::Dial {
                address: address.to_string(),
                reason: "node stopped".to_string(),
            }));
        }

        self.shared.peers.write().await.clear_connections();
        self.shared.self_addrs.write().await.clear();
        info!(peer_id = %self.swarm.local_peer_id(), "event loop stopped");
    }
}
