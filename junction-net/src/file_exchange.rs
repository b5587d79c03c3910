//! File exchange: announce a file id on the file topic, serve its body to
//! peers that request it over the file exchange protocol.

use std::collections::HashMap;
use std::sync::Arc;

use libp2p::PeerId;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastChannel;
use crate::error::NetworkError;
use crate::event_loop::{call, Command};
use crate::protocol::CHAT_FILE_TOPIC;
use crate::types::{BroadcastMessage, FileRecord, FileRequest, FileResponse};

/// In-memory table of offered files, keyed by id.
///
/// Owned by the application and shared with the node. Entries are never
/// evicted by the node.
#[derive(Default)]
pub struct FileStore {
    files: RwLock<HashMap<String, FileRecord>>,
}

impl FileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub async fn insert(&self, record: FileRecord) {
        self.files.write().await.insert(record.id.clone(), record);
    }

    pub async fn get(&self, id: &str) -> Option<FileRecord> {
        self.files.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<FileRecord> {
        self.files.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }
}

/// Answer an inbound file request from the store.
pub async fn serve_request(store: &FileStore, request: &FileRequest) -> FileResponse {
    match store.get(&request.id).await {
        Some(record) => {
            debug!(id = %request.id, size = record.body.len(), "serving file");
            FileResponse::Found(record.body)
        }
        None => {
            debug!(id = %request.id, "requested file not found");
            FileResponse::NotFound
        }
    }
}

/// A file announcement seen on the file topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAnnouncement {
    pub id: String,
    pub sender: PeerId,
}

impl FileAnnouncement {
    /// Interpret a broadcast message as a file announcement. Returns `None`
    /// for other topics and for messages without an origin.
    pub fn from_message(message: &BroadcastMessage) -> Option<Self> {
        if message.topic != CHAT_FILE_TOPIC {
            return None;
        }
        Some(Self {
            id: message.text(),
            sender: message.origin_peer?,
        })
    }
}

/// Handle for offering and fetching files.
#[derive(Clone)]
pub struct FileExchangeChannel {
    commands: mpsc::Sender<Command>,
    store: Arc<FileStore>,
    broadcast: BroadcastChannel,
    local_peer_id: PeerId,
}

impl FileExchangeChannel {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        store: Arc<FileStore>,
        broadcast: BroadcastChannel,
        local_peer_id: PeerId,
    ) -> Self {
        Self {
            commands,
            store,
            broadcast,
            local_peer_id,
        }
    }

    /// Store `body` under `id` and announce the id on the file topic.
    ///
    /// The announcement is fire-and-forget: a publish failure is logged and
    /// the file stays available to peers that already know the id.
    pub async fn offer(&self, id: impl Into<String>, body: Vec<u8>) -> FileRecord {
        let record = FileRecord {
            id: id.into(),
            body,
            sender_peer: self.local_peer_id,
        };
        self.store.insert(record.clone()).await;

        match self
            .broadcast
            .publish(CHAT_FILE_TOPIC, record.id.as_bytes().to_vec())
            .await
        {
            Ok(receipt) => info!(
                id = %record.id,
                recipients = receipt.recipient_count,
                "file offered"
            ),
            Err(e) => warn!(id = %record.id, "file announcement failed: {}", e),
        }
        record
    }

    /// Pull the body of `id` from `peer`.
    pub async fn fetch(&self, peer: PeerId, id: &str) -> Result<Vec<u8>, NetworkError> {
        let request = FileRequest { id: id.to_string() };
        let result = call(&self.commands, |reply| Command::FetchFile {
            peer,
            request,
            reply,
        })
        .await
        .and_then(|r| r);

        match &result {
            Ok(body) => info!(%peer, %id, size = body.len(), "file received"),
            Err(e) => warn!(%peer, %id, "file fetch failed: {}", e),
        }
        result
    }

    /// The table files are served from.
    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }
}
