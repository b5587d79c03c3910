//! Topic broadcast: signed-only delivery with identity-based deduplication.

use std::collections::{HashSet, VecDeque};

use libp2p::gossipsub::{self, MessageId};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::behaviour::message_identity;
use crate::error::NetworkError;
use crate::event_loop::{call, Command};
use crate::types::BroadcastMessage;

/// Outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Number of peers subscribed to the topic when the message was sent.
    pub recipient_count: usize,
}

/// Bounded set of recently seen message identities. Oldest entries are
/// evicted first once the capacity is reached.
pub struct SeenCache {
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
    capacity: usize,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Insert an identity. Returns false if it was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        if self.seen.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.clone());
        self.order.push_back(id);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

/// Filters inbound gossipsub messages and fans them out to subscribers.
///
/// Unsigned messages are dropped. Deliveries that share a message identity
/// are coalesced into one.
pub struct BroadcastDispatcher {
    seen: SeenCache,
    tx: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastDispatcher {
    pub fn new(capacity: usize, tx: broadcast::Sender<BroadcastMessage>) -> Self {
        Self {
            seen: SeenCache::new(capacity),
            tx,
        }
    }

    /// Dispatch one inbound message. Returns whether subscribers were handed it.
    pub fn dispatch(&mut self, message: gossipsub::Message) -> bool {
        let signed = message.source.is_some() && message.sequence_number.is_some();
        if !signed {
            debug!(topic = %message.topic, "dropping unsigned broadcast message");
            return false;
        }

        if !self.seen.insert(message_identity(message.sequence_number)) {
            debug!(
                topic = %message.topic,
                seqno = ?message.sequence_number,
                "dropping duplicate broadcast message"
            );
            return false;
        }

        let msg = BroadcastMessage {
            topic: message.topic.as_str().to_string(),
            payload: message.data,
            origin_peer: message.source,
            sequence_number: message.sequence_number,
            signed,
        };
        // No receivers is not an error: the message is simply unobserved.
        let _ = self.tx.send(msg);
        true
    }

    pub fn reset(&mut self) {
        self.seen.clear();
    }
}

/// Handle for publishing to and receiving from broadcast topics.
#[derive(Clone)]
pub struct BroadcastChannel {
    commands: mpsc::Sender<Command>,
    messages: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastChannel {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        messages: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        Self { commands, messages }
    }

    /// Publish `payload` on `topic`. Publishing with no subscribed peers and
    /// re-publishing an identical message both succeed with zero recipients.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<PublishReceipt, NetworkError> {
        let topic = topic.to_string();
        let payload = payload.into();
        let recipient_count = call(&self.commands, |reply| Command::Publish {
            topic,
            payload,
            reply,
        })
        .await??;
        Ok(PublishReceipt { recipient_count })
    }

    /// Receive every accepted inbound message on the subscribed topics.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.messages.subscribe()
    }

    /// Leave a topic. Leaving a topic that is not joined is a no-op.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), NetworkError> {
        let topic = topic.to_string();
        call(&self.commands, |reply| Command::Unsubscribe { topic, reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::PeerId;

    fn message(seqno: Option<u64>, source: Option<PeerId>, data: &[u8]) -> gossipsub::Message {
        gossipsub::Message {
            source,
            data: data.to_vec(),
            sequence_number: seqno,
            topic: gossipsub::IdentTopic::new("universal-connectivity").hash(),
        }
    }

    #[test]
    fn test_seen_cache_evicts_oldest() {
        let mut cache = SeenCache::new(2);
        assert!(cache.insert(message_identity(Some(1))));
        assert!(cache.insert(message_identity(Some(2))));
        assert!(!cache.insert(message_identity(Some(1))));
        assert!(cache.insert(message_identity(Some(3))));
        assert_eq!(cache.len(), 2);
        // 1 was evicted and is accepted again.
        assert!(cache.insert(message_identity(Some(1))));
    }

    #[test]
    fn test_duplicates_delivered_once() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut dispatcher = BroadcastDispatcher::new(64, tx);
        let origin = PeerId::random();

        assert!(dispatcher.dispatch(message(Some(5), Some(origin), b"hi")));
        assert!(!dispatcher.dispatch(message(Some(5), Some(origin), b"hi")));
        assert!(!dispatcher.dispatch(message(Some(5), Some(origin), b"other bytes")));
        assert!(dispatcher.dispatch(message(Some(6), Some(origin), b"hi")));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.sequence_number, Some(5));
        assert_eq!(first.payload, b"hi".to_vec());
        assert!(first.signed);
        assert_eq!(first.origin_peer, Some(origin));
        assert_eq!(rx.try_recv().unwrap().sequence_number, Some(6));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unsigned_messages_never_delivered() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut dispatcher = BroadcastDispatcher::new(64, tx);

        assert!(!dispatcher.dispatch(message(None, None, b"anon")));
        assert!(!dispatcher.dispatch(message(Some(1), None, b"no source")));
        assert!(!dispatcher.dispatch(message(None, Some(PeerId::random()), b"no seqno")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_without_receivers_still_counts() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        let mut dispatcher = BroadcastDispatcher::new(8, tx);
        assert!(dispatcher.dispatch(message(Some(1), Some(PeerId::random()), b"x")));
    }

    #[test]
    fn test_reset_forgets_identities() {
        let (tx, _rx) = broadcast::channel(4);
        let mut dispatcher = BroadcastDispatcher::new(8, tx);
        let origin = Some(PeerId::random());
        assert!(dispatcher.dispatch(message(Some(1), origin, b"x")));
        dispatcher.reset();
        assert!(dispatcher.dispatch(message(Some(1), origin, b"x")));
    }
}
