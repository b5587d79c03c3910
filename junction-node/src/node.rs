use std::path::{Path, PathBuf};
use std::sync::Arc;

use console::Style;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use junction_net::protocol::CHAT_TOPIC;
use junction_net::{
    BroadcastMessage, DirectMessage, FileAnnouncement, FileExchangeChannel, FileStore, NodeEvent,
    NodeHandle, PeerConfig, PeerId, PeerNode,
};

use crate::config::FilesConfig;
use crate::error::NodeError;
use crate::input::{parse_input, Input, HELP};

/// Start a peer and drive the interactive console until `/quit`, ctrl-c,
/// SIGTERM or end of input.
pub async fn run(config: PeerConfig, files: FilesConfig) -> Result<(), NodeError> {
    let node = PeerNode::new(config, Arc::new(FileStore::new()))?;
    let handle = node.start().await?;

    let console = Console::new();
    console.info(format!("peer id {}", handle.local_peer_id()));
    console.info("type /help for commands");

    let result = drive(&handle, &console, &files).await;

    node.stop().await?;
    tracing::info!("node stopped");
    result
}

async fn drive(handle: &NodeHandle, console: &Console, files: &FilesConfig) -> Result<(), NodeError> {
    let mut events = handle.subscribe_events();
    let mut broadcasts = handle.broadcast().subscribe();
    let mut direct = handle.direct_messages().subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("received shutdown signal");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => console.event(&event),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "event stream lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
            message = broadcasts.recv() => match message {
                Ok(message) => on_broadcast(handle, console, files, message),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "broadcast stream lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
            message = direct.recv() => match message {
                Ok(message) => console.direct(&message),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "direct message stream lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    if !on_line(handle, console, &line) {
                        return Ok(());
                    }
                }
                None => {
                    tracing::debug!("stdin closed");
                    stdin_open = false;
                }
            },
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn on_broadcast(
    handle: &NodeHandle,
    console: &Console,
    files: &FilesConfig,
    message: BroadcastMessage,
) {
    if let Some(announcement) = FileAnnouncement::from_message(&message) {
        console.announcement(&announcement);
        if files.auto_fetch && announcement.sender != handle.local_peer_id() {
            let channel = handle.files().clone();
            let dir = PathBuf::from(&files.download_dir);
            tokio::spawn(async move {
                match fetch_to_disk(&channel, &announcement, &dir).await {
                    Ok(path) => tracing::info!(path = %path.display(), "file saved"),
                    Err(e) => tracing::warn!(id = %announcement.id, "auto-fetch failed: {}", e),
                }
            });
        }
    } else if message.topic == CHAT_TOPIC {
        console.chat(&message);
    }
}

/// Handle one console line. Returns false when the console should exit.
///
/// Commands that touch the network run on their own task so a slow dial or
/// request never holds up signals and inbound messages.
fn on_line(handle: &NodeHandle, console: &Console, line: &str) -> bool {
    let input = match parse_input(line) {
        Ok(input) => input,
        Err(e) => {
            console.error(e);
            return true;
        }
    };

    match input {
        Input::Empty => {}
        Input::Help => println!("{}", HELP),
        Input::Quit => return false,
        input => {
            tokio::spawn(run_command(handle.clone(), console.clone(), input));
        }
    }
    true
}

async fn run_command(handle: NodeHandle, console: Console, input: Input) {
    match input {
        Input::Chat(text) => match handle.broadcast().publish(CHAT_TOPIC, text).await {
            Ok(receipt) if receipt.recipient_count == 0 => {
                console.info("message published, no peers subscribed yet")
            }
            Ok(_) => {}
            Err(e) => console.error(e),
        },
        Input::Direct { peer, text } => {
            if handle.direct_messages().send(peer, &text).await {
                console.info(format!("delivered to {}", short_peer(&peer)));
            } else {
                console.error(format!("direct message to {} failed", short_peer(&peer)));
            }
        }
        Input::Offer(path) => match tokio::fs::read(&path).await {
            Ok(body) => {
                let id = uuid::Uuid::new_v4().to_string();
                let size = body.len();
                handle.files().offer(id.clone(), body).await;
                console.info(format!("offered {} as {} ({} bytes)", path.display(), id, size));
            }
            Err(e) => console.error(format!("cannot read {}: {}", path.display(), e)),
        },
        Input::Connect(address) => match handle.connect(address).await {
            Ok(peer) => console.info(format!("connected to {}", peer)),
            Err(e) => console.error(e),
        },
        Input::Disconnect(peer) => match handle.disconnect(peer).await {
            Ok(true) => console.info(format!("disconnected from {}", short_peer(&peer))),
            Ok(false) => console.error(format!("not connected to {}", short_peer(&peer))),
            Err(e) => console.error(e),
        },
        Input::Peers => {
            let connections = handle.connections().await;
            if connections.is_empty() {
                console.info("no open connections");
            }
            for conn in connections {
                console.info(format!(
                    "{} {} via {}",
                    conn.remote_peer,
                    conn.direction,
                    conn.protocols().join("/"),
                ));
            }
        }
        Input::Empty | Input::Help | Input::Quit => {}
    }
}

/// Fetch an announced file and write it under `dir`, named by its id.
async fn fetch_to_disk(
    channel: &FileExchangeChannel,
    announcement: &FileAnnouncement,
    dir: &Path,
) -> Result<PathBuf, NodeError> {
    let body = channel.fetch(announcement.sender, &announcement.id).await?;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(sanitize_file_name(&announcement.id));
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

/// File ids come from the network; keep only characters safe in a single
/// path component.
fn sanitize_file_name(id: &str) -> String {
    let name: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    match name.trim_matches('.') {
        "" => "unnamed".to_string(),
        trimmed => trimmed.to_string(),
    }
}

fn short_peer(peer: &PeerId) -> String {
    let s = peer.to_string();
    let tail = s.len().saturating_sub(8);
    format!("…{}", &s[tail..])
}

#[derive(Clone)]
struct Console {
    dim: Style,
    cyan: Style,
    yellow: Style,
    red: Style,
    green: Style,
}

impl Console {
    fn new() -> Self {
        Self {
            dim: Style::new().dim(),
            cyan: Style::new().cyan(),
            yellow: Style::new().yellow(),
            red: Style::new().red(),
            green: Style::new().green().bold(),
        }
    }

    fn info(&self, text: impl std::fmt::Display) {
        println!("{} {}", self.dim.apply_to("::"), text);
    }

    fn error(&self, text: impl std::fmt::Display) {
        println!("{} {}", self.red.apply_to("!!"), text);
    }

    fn chat(&self, message: &BroadcastMessage) {
        let from = message
            .origin_peer
            .as_ref()
            .map(short_peer)
            .unwrap_or_else(|| "anonymous".to_string());
        println!("{} {}", self.cyan.apply_to(format!("<{}>", from)), message.text());
    }

    fn direct(&self, message: &DirectMessage) {
        println!(
            "{} {}",
            self.green.apply_to(format!("[dm {}]", short_peer(&message.from))),
            message.data
        );
    }

    fn announcement(&self, announcement: &FileAnnouncement) {
        println!(
            "{} {} offers file {}",
            self.yellow.apply_to("[file]"),
            short_peer(&announcement.sender),
            announcement.id
        );
    }

    fn event(&self, event: &NodeEvent) {
        match event {
            NodeEvent::PeerDiscovered { peer_id, addresses } => tracing::debug!(
                peer = %peer_id,
                addresses = addresses.len(),
                "peer discovered"
            ),
            NodeEvent::ConnectionOpened(conn) => self.info(format!(
                "{} {} ({})",
                self.green.apply_to("+"),
                conn.remote_peer,
                conn.remote_address
            )),
            NodeEvent::ConnectionClosed(conn) => {
                self.info(format!("{} {}", self.red.apply_to("-"), conn.remote_peer))
            }
            NodeEvent::SelfAddressChanged { addresses } => {
                for address in addresses {
                    self.info(format!("listening on {}", self.cyan.apply_to(address)));
                }
            }
        }
    }
}
