use async_trait::async_trait;
use payment_consumer::{
    Checkpoint, Delivery, Handler, HandlerError, InMemoryTransport, Message, Payment,
    TerminalEvent, Transport, TransportError,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(env_filter).try_init();
}

pub fn payment(reference: &str) -> Payment {
    Payment::new(reference, Decimal::new(1999, 2))
}

pub fn message(key: &str, reference: &str) -> Message {
    Message::new(key, payment(reference))
}

/// Finds a key the transport's partitioner maps to the wanted partition.
pub fn key_for_partition(transport: &InMemoryTransport, partition: usize) -> String {
    for i in 0.. {
        let key = format!("acct-{i}");
        if transport.partition_for(&key) == partition {
            return key;
        }
    }
    unreachable!()
}

/// Waits for the next terminal event, bounded like the original 5-second
/// observation windows.
pub async fn await_event(events: &mut broadcast::Receiver<TerminalEvent>) -> TerminalEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no terminal event within 5s")
        .expect("event channel closed")
}

/// Broker stand-in with injectable faults: publishes to one topic, or all
/// commits, can be made to fail until `heal` is called.
pub struct FlakyTransport {
    inner: InMemoryTransport,
    failing_publish_topic: Option<String>,
    publish_failing: AtomicBool,
    commit_failing: AtomicBool,
}

impl FlakyTransport {
    pub fn failing_publishes_to(topic: &str) -> Self {
        Self {
            inner: InMemoryTransport::new(),
            failing_publish_topic: Some(topic.to_string()),
            publish_failing: AtomicBool::new(true),
            commit_failing: AtomicBool::new(false),
        }
    }

    pub fn failing_commits() -> Self {
        Self {
            inner: InMemoryTransport::new(),
            failing_publish_topic: None,
            publish_failing: AtomicBool::new(false),
            commit_failing: AtomicBool::new(true),
        }
    }

    pub fn heal(&self) {
        self.publish_failing.store(false, Ordering::SeqCst);
        self.commit_failing.store(false, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryTransport {
        &self.inner
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError> {
        self.inner.subscribe(topic, group_id).await
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        if self.publish_failing.load(Ordering::SeqCst)
            && self.failing_publish_topic.as_deref() == Some(topic)
        {
            return Err(TransportError::PublishFailed("injected broker failure".to_string()));
        }
        self.inner.publish(topic, message).await
    }

    async fn commit(
        &self,
        topic: &str,
        group_id: &str,
        checkpoint: Checkpoint,
    ) -> Result<(), TransportError> {
        if self.commit_failing.load(Ordering::SeqCst) {
            return Err(TransportError::CommitFailed("injected broker failure".to_string()));
        }
        self.inner.commit(topic, group_id, checkpoint).await
    }

    async fn committed(
        &self,
        topic: &str,
        group_id: &str,
        shard: usize,
    ) -> Result<Option<Checkpoint>, TransportError> {
        self.inner.committed(topic, group_id, shard).await
    }
}

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    AlwaysFail,
    /// Fail the first `n` invocations for the named reference, succeed on
    /// everything else.
    FailFirstFor(String, u32),
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub reference: String,
    pub key: String,
    pub attempt: u32,
}

/// Test double standing in for user processing logic: records every
/// invocation and fails on demand.
pub struct RecordingHandler {
    behavior: Behavior,
    calls: AtomicU32,
    invocations: Mutex<Vec<Invocation>>,
    per_reference: Mutex<HashMap<String, u32>>,
    delay_for_key: Option<(String, Duration)>,
}

impl RecordingHandler {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: AtomicU32::new(0),
            invocations: Mutex::new(Vec::new()),
            per_reference: Mutex::new(HashMap::new()),
            delay_for_key: None,
        }
    }

    pub fn with_delay_for_key(mut self, key: &str, delay: Duration) -> Self {
        self.delay_for_key = Some((key.to_string(), delay));
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        if let Some((key, delay)) = &self.delay_for_key {
            if key == &message.key {
                tokio::time::sleep(*delay).await;
            }
        }

        self.calls.fetch_add(1, Ordering::SeqCst);
        let reference = message.payload.reference.clone();
        self.invocations.lock().unwrap().push(Invocation {
            reference: reference.clone(),
            key: message.key.clone(),
            attempt: message.attempt,
        });
        let count = {
            let mut per_reference = self.per_reference.lock().unwrap();
            let entry = per_reference.entry(reference).or_insert(0);
            *entry += 1;
            *entry
        };

        match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::AlwaysFail => Err(HandlerError::Failed(
                "Simulating error in main consumer".to_string(),
            )),
            Behavior::FailFirstFor(reference, times)
                if reference == &message.payload.reference && count <= *times =>
            {
                Err(HandlerError::Failed(format!(
                    "Simulated failure {count} for {reference}"
                )))
            }
            Behavior::FailFirstFor(_, _) => Ok(()),
        }
    }
}
