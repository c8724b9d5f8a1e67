use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use time::{OffsetDateTime, UtcDateTime, UtcOffset};

#[derive(Debug)]
pub enum HandlerError {
    Failed(String),
    TimedOut,
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Failed(reason) => write!(f, "Handler failed: {}", reason),
            HandlerError::TimedOut => write!(f, "Handler timed out"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// User-supplied processing logic for one message.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

/// Captured failure of one handler invocation. Lives only between the
/// invocation and the next routing decision.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub message: Message,
    pub reason: String,
    pub failed_at: OffsetDateTime,
    pub attempt: u32,
}

/// Makes exactly one call into the handler per invocation, bounded by the
/// per-attempt timeout. Never retries internally, never swallows a failure.
pub struct HandlerInvoker<H> {
    handler: Arc<H>,
    timeout: Duration,
}

impl<H: Handler> HandlerInvoker<H> {
    pub fn new(handler: Arc<H>, timeout: Duration) -> Self {
        Self { handler, timeout }
    }

    pub async fn invoke(&self, message: &Message) -> Result<(), FailureRecord> {
        match tokio::time::timeout(self.timeout, self.handler.handle(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Self::failure(message, e.to_string())),
            Err(_) => Err(Self::failure(message, HandlerError::TimedOut.to_string())),
        }
    }

    fn failure(message: &Message, reason: String) -> FailureRecord {
        FailureRecord {
            message: message.clone(),
            reason,
            failed_at: UtcDateTime::now().to_offset(UtcOffset::UTC),
            // The attempt that just completed, counting from 1.
            attempt: message.attempt + 1,
        }
    }
}
