use crate::message::{Message, Payment};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::{Mutex, mpsc};

/// Durable consumption position within one shard of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub shard: usize,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub checkpoint: Checkpoint,
}

#[derive(Debug)]
pub enum TransportError {
    SubscribeFailed(String),
    PublishFailed(String),
    CommitFailed(String),
    Timeout,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::SubscribeFailed(e) => write!(f, "Subscribe failed: {}", e),
            TransportError::PublishFailed(e) => write!(f, "Publish failed: {}", e),
            TransportError::CommitFailed(e) => write!(f, "Commit failed: {}", e),
            TransportError::Timeout => write!(f, "Transport operation timed out"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Boundary with the external broker. Publish is at-least-once; commit is
/// idempotent and never moves a position backwards; a subscription resumes
/// after the last committed checkpoint of its group.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError>;

    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError>;

    async fn commit(
        &self,
        topic: &str,
        group_id: &str,
        checkpoint: Checkpoint,
    ) -> Result<(), TransportError>;

    async fn committed(
        &self,
        topic: &str,
        group_id: &str,
        shard: usize,
    ) -> Result<Option<Checkpoint>, TransportError>;
}

const SUBSCRIPTION_BUFFER: usize = 1024;

struct StoredRecord {
    key: String,
    payload: Bytes,
    headers: HashMap<String, String>,
}

struct TopicState {
    partitions: Vec<Vec<StoredRecord>>,
    subscribers: Vec<mpsc::Sender<Delivery>>,
}

impl TopicState {
    fn new(num_partitions: usize) -> Self {
        Self {
            partitions: (0..num_partitions).map(|_| Vec::new()).collect(),
            subscribers: Vec::new(),
        }
    }
}

struct Inner {
    topics: HashMap<String, TopicState>,
    committed: HashMap<(String, String, usize), u64>,
}

/// Channel-backed broker stand-in. Records are kept as encoded bytes so the
/// payload codec runs on both sides of every delivery, the same as a wire
/// transport would force.
pub struct InMemoryTransport {
    num_partitions: usize,
    inner: Mutex<Inner>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    pub fn with_partitions(num_partitions: usize) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
            inner: Mutex::new(Inner {
                topics: HashMap::new(),
                committed: HashMap::new(),
            }),
        }
    }

    /// The partition a key maps to, as the producer side assigns it.
    pub fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.num_partitions as u64) as usize
    }

    fn delivery(record: &StoredRecord, checkpoint: Checkpoint) -> Option<Delivery> {
        let payload = match Payment::decode(&record.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Dropping undecodable record");
                return None;
            }
        };
        Some(Delivery {
            message: Message {
                key: record.key.clone(),
                payload,
                headers: record.headers.clone(),
                attempt: 0,
            },
            checkpoint,
        })
    }

    /// Messages currently stored on a topic, across all partitions in offset
    /// order. Test observability hook.
    pub async fn topic_contents(&self, topic: &str) -> Vec<Message> {
        let inner = self.inner.lock().await;
        let Some(state) = inner.topics.get(topic) else {
            return Vec::new();
        };
        let mut messages = Vec::new();
        for (shard, partition) in state.partitions.iter().enumerate() {
            for (offset, record) in partition.iter().enumerate() {
                let checkpoint = Checkpoint { shard, offset: offset as u64 };
                if let Some(delivery) = Self::delivery(record, checkpoint) {
                    messages.push(delivery.message);
                }
            }
        }
        messages
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let num_partitions = self.num_partitions;
        let state = inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(num_partitions));

        // Replay everything past the committed checkpoint before going live.
        let mut replay = Vec::new();
        for (shard, partition) in state.partitions.iter().enumerate() {
            let resume_from = inner
                .committed
                .get(&(topic.to_string(), group_id.to_string(), shard))
                .map(|offset| offset + 1)
                .unwrap_or(0);
            for (offset, record) in partition.iter().enumerate().skip(resume_from as usize) {
                let checkpoint = Checkpoint { shard, offset: offset as u64 };
                if let Some(delivery) = Self::delivery(record, checkpoint) {
                    replay.push(delivery);
                }
            }
        }
        for delivery in replay {
            if sender.try_send(delivery).is_err() {
                tracing::warn!(topic, "Subscription buffer full during replay");
                break;
            }
        }
        state.subscribers.push(sender);
        Ok(receiver)
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        let payload = message
            .payload
            .encode()
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;
        let record = StoredRecord {
            key: message.key.clone(),
            payload,
            headers: message.headers.clone(),
        };

        let (delivery, senders) = {
            let mut inner = self.inner.lock().await;
            let num_partitions = self.num_partitions;
            let state = inner
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicState::new(num_partitions));
            let shard = self.partition_for(&message.key);
            let offset = state.partitions[shard].len() as u64;
            let checkpoint = Checkpoint { shard, offset };
            let delivery = Self::delivery(&record, checkpoint);
            state.partitions[shard].push(record);
            state.subscribers.retain(|s| !s.is_closed());
            (delivery, state.subscribers.clone())
        };

        if let Some(delivery) = delivery {
            for sender in senders {
                let _ = sender.send(delivery.clone()).await;
            }
        }
        Ok(())
    }

    async fn commit(
        &self,
        topic: &str,
        group_id: &str,
        checkpoint: Checkpoint,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        let key = (topic.to_string(), group_id.to_string(), checkpoint.shard);
        let entry = inner.committed.entry(key).or_insert(checkpoint.offset);
        // Idempotent, and never moves backwards.
        if checkpoint.offset > *entry {
            *entry = checkpoint.offset;
        }
        Ok(())
    }

    async fn committed(
        &self,
        topic: &str,
        group_id: &str,
        shard: usize,
    ) -> Result<Option<Checkpoint>, TransportError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .committed
            .get(&(topic.to_string(), group_id.to_string(), shard))
            .map(|&offset| Checkpoint { shard, offset }))
    }
}
