use crate::config::{ConfigError, ConsumerConfig, MaxAttempts};
use crate::handler::FailureRecord;
use crate::message::{HEADER_ATTEMPTS, HEADER_DEATH_REASON, HEADER_ORIGINAL_TOPIC};
use crate::retry::{MAX_TRANSPORT_ATTEMPTS, RetryDecision, RetryPolicy};
use crate::transport::{Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingOutcome {
    Forwarded,
    Suppressed,
}

/// Terminal routing for exhausted occurrences. The variant is fixed at
/// construction from configuration; decisions are deterministic given the same
/// failure and configuration.
pub enum DeadLetterRouter<T> {
    Forwarding {
        transport: Arc<T>,
        dead_letter_topic: String,
        source_topic: String,
        publish_retry: RetryPolicy,
        publish_timeout: Duration,
    },
    Disabled,
}

impl<T: Transport> DeadLetterRouter<T> {
    pub fn from_config(config: &ConsumerConfig, transport: Arc<T>) -> Result<Self, ConfigError> {
        if !config.dead_letter_enabled {
            return Ok(DeadLetterRouter::Disabled);
        }
        let dead_letter_topic = config
            .dead_letter_topic
            .clone()
            .ok_or(ConfigError::MissingDeadLetterTopic)?;
        Ok(DeadLetterRouter::Forwarding {
            transport,
            dead_letter_topic,
            source_topic: config.topic.clone(),
            publish_retry: RetryPolicy::new(
                MaxAttempts::Finite(MAX_TRANSPORT_ATTEMPTS),
                config.backoff,
            ),
            publish_timeout: config.per_attempt_timeout,
        })
    }

    /// Forwards the failed occurrence or absorbs it, and nothing else. An `Err`
    /// means the dead-letter publish could not be completed; the caller must
    /// leave the checkpoint uncommitted so the occurrence is redelivered.
    pub async fn route(
        &self,
        failure: FailureRecord,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RoutingOutcome, TransportError> {
        match self {
            DeadLetterRouter::Disabled => {
                tracing::debug!(
                    reference = %failure.message.payload.reference,
                    attempts = failure.attempt,
                    "Retries exhausted, dead-lettering disabled, absorbing failure"
                );
                Ok(RoutingOutcome::Suppressed)
            }
            DeadLetterRouter::Forwarding {
                transport,
                dead_letter_topic,
                source_topic,
                publish_retry,
                publish_timeout,
            } => {
                let mut message = failure.message;
                message
                    .headers
                    .insert(HEADER_DEATH_REASON.to_string(), failure.reason.clone());
                message
                    .headers
                    .insert(HEADER_ORIGINAL_TOPIC.to_string(), source_topic.clone());
                message
                    .headers
                    .insert(HEADER_ATTEMPTS.to_string(), failure.attempt.to_string());

                let mut publish_attempts = 0u32;
                loop {
                    let publish = transport.publish(dead_letter_topic, message.clone());
                    let result = match tokio::time::timeout(*publish_timeout, publish).await {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::Timeout),
                    };
                    match result {
                        Ok(()) => {
                            tracing::info!(
                                reference = %message.payload.reference,
                                topic = %dead_letter_topic,
                                "Forwarded exhausted message to dead-letter topic"
                            );
                            return Ok(RoutingOutcome::Forwarded);
                        }
                        Err(e) => {
                            publish_attempts += 1;
                            match publish_retry.decide(publish_attempts) {
                                RetryDecision::Retry(delay) => {
                                    tracing::warn!(
                                        error = %e,
                                        attempt = publish_attempts,
                                        "Dead-letter publish failed, retrying"
                                    );
                                    tokio::select! {
                                        _ = tokio::time::sleep(delay) => {}
                                        _ = shutdown.changed() => {
                                            tracing::info!("Abandoning dead-letter publish on shutdown");
                                            return Err(e);
                                        }
                                    }
                                }
                                RetryDecision::Exhausted => return Err(e),
                            }
                        }
                    }
                }
            }
        }
    }
}
