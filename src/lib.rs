//! Payment event consumption with bounded retries and optional dead-letter
//! forwarding. Failed handler invocations are retried per the configured
//! backoff; once exhausted, the occurrence is either republished to a
//! dead-letter topic with failure metadata or terminally absorbed, and only
//! then is its checkpoint committed.

mod config;
mod consumer;
mod dead_letter;
mod handler;
mod message;
mod retry;
mod transport;

pub use config::{Backoff, ConfigError, ConsumerConfig, MaxAttempts};
pub use consumer::{Consumer, Outcome, TerminalEvent};
pub use dead_letter::{DeadLetterRouter, RoutingOutcome};
pub use handler::{FailureRecord, Handler, HandlerError, HandlerInvoker};
pub use message::{
    CodecError, HEADER_ATTEMPTS, HEADER_DEATH_REASON, HEADER_ORIGINAL_TOPIC, Message, Payment,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{Checkpoint, Delivery, InMemoryTransport, Transport, TransportError};
