use crate::config::{ConfigError, ConsumerConfig, MaxAttempts};
use crate::dead_letter::{DeadLetterRouter, RoutingOutcome};
use crate::handler::{Handler, HandlerInvoker};
use crate::message::Message;
use crate::retry::{MAX_TRANSPORT_ATTEMPTS, RetryDecision, RetryPolicy};
use crate::transport::{Checkpoint, Delivery, Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

const BUFFER_SIZE: usize = 32768;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    DeadLettered,
    Suppressed,
}

/// Emitted once per message occurrence when it reaches a terminal state.
/// Tests and callers subscribe to these instead of intercepting handler calls.
#[derive(Debug, Clone)]
pub struct TerminalEvent {
    pub reference: String,
    pub key: String,
    pub attempts: u32,
    pub outcome: Outcome,
}

/// One listener: a dispatch task feeding one worker per shard. Messages on the
/// same shard are processed strictly in arrival order; a retrying message
/// suspends only its own shard. The checkpoint for an occurrence is committed
/// only after a successful invocation or a terminal routing outcome.
pub struct Consumer {
    events: broadcast::Sender<TerminalEvent>,
    shutdown: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

struct ShardContext<T, H> {
    invoker: HandlerInvoker<H>,
    retry_policy: RetryPolicy,
    transport_retry: RetryPolicy,
    router: Arc<DeadLetterRouter<T>>,
    transport: Arc<T>,
    topic: String,
    group_id: String,
    per_attempt_timeout: Duration,
    events: broadcast::Sender<TerminalEvent>,
}

impl Consumer {
    /// Validates the configuration and starts consuming. Handler and transport
    /// failures never surface past this point; they are contained in the loop.
    pub fn start<T: Transport, H: Handler>(
        config: ConsumerConfig,
        transport: Arc<T>,
        handler: Arc<H>,
    ) -> Result<Consumer, ConfigError> {
        config.validate()?;
        let router = Arc::new(DeadLetterRouter::from_config(&config, transport.clone())?);
        let retry_policy = RetryPolicy::new(config.max_attempts, config.backoff);
        // Broker operations keep the listener's backoff but never an unlimited
        // attempt budget.
        let transport_retry =
            RetryPolicy::new(MaxAttempts::Finite(MAX_TRANSPORT_ATTEMPTS), config.backoff);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shard_buffer = (BUFFER_SIZE / config.num_shards).max(1);
        let mut senders = Vec::with_capacity(config.num_shards);
        let mut workers = Vec::with_capacity(config.num_shards);
        for shard_id in 0..config.num_shards {
            let (sender, receiver) = mpsc::channel(shard_buffer);
            let ctx = ShardContext {
                invoker: HandlerInvoker::new(handler.clone(), config.per_attempt_timeout),
                retry_policy,
                transport_retry,
                router: router.clone(),
                transport: transport.clone(),
                topic: config.topic.clone(),
                group_id: config.group_id.clone(),
                per_attempt_timeout: config.per_attempt_timeout,
                events: events.clone(),
            };
            let worker_shutdown = shutdown_rx.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(shard_id, receiver, ctx, worker_shutdown).await;
            }));
            senders.push(sender);
        }
        tracing::info!(
            topic = %config.topic,
            num_shards = config.num_shards,
            "Started shard workers"
        );

        let dispatch = tokio::spawn(dispatch_loop(
            config,
            transport,
            senders,
            transport_retry,
            shutdown_rx,
        ));

        Ok(Consumer { events, shutdown, dispatch, workers })
    }

    /// A subscription to terminal outcomes. Subscribe before publishing if no
    /// event may be missed.
    pub fn events(&self) -> broadcast::Receiver<TerminalEvent> {
        self.events.subscribe()
    }

    /// Orderly shutdown: an in-flight terminal routing is drained, an in-flight
    /// backoff wait is abandoned (the occurrence stays uncommitted and is
    /// redelivered later), then all workers are awaited.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.dispatch.await;
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn dispatch_loop<T: Transport>(
    config: ConsumerConfig,
    transport: Arc<T>,
    senders: Vec<mpsc::Sender<Delivery>>,
    transport_retry: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(mut subscription) =
        subscribe_with_retry(&config, &transport, transport_retry, &mut shutdown).await
    else {
        return;
    };

    loop {
        tokio::select! {
            maybe = subscription.recv() => match maybe {
                Some(delivery) => {
                    let shard = delivery.checkpoint.shard % senders.len();
                    if senders[shard].send(delivery).await.is_err() {
                        tracing::error!(shard, "Shard worker gone, stopping dispatch");
                        return;
                    }
                }
                None => {
                    tracing::info!(topic = %config.topic, "Subscription closed, stopping dispatch");
                    return;
                }
            },
            _ = shutdown.changed() => {
                tracing::info!(topic = %config.topic, "Dispatch shutting down");
                return;
            }
        }
    }
}

async fn subscribe_with_retry<T: Transport>(
    config: &ConsumerConfig,
    transport: &Arc<T>,
    transport_retry: RetryPolicy,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<mpsc::Receiver<Delivery>> {
    let mut attempts = 0u32;
    loop {
        let subscribe = transport.subscribe(&config.topic, &config.group_id);
        let result = match tokio::time::timeout(config.per_attempt_timeout, subscribe).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        match result {
            Ok(subscription) => return Some(subscription),
            Err(e) => {
                attempts += 1;
                match transport_retry.decide(attempts) {
                    RetryDecision::Retry(delay) => {
                        tracing::warn!(error = %e, topic = %config.topic, "Subscribe failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => return None,
                        }
                    }
                    RetryDecision::Exhausted => {
                        tracing::error!(error = %e, topic = %config.topic, "Giving up subscribing");
                        return None;
                    }
                }
            }
        }
    }
}

async fn worker_loop<T: Transport, H: Handler>(
    shard_id: usize,
    mut receiver: mpsc::Receiver<Delivery>,
    ctx: ShardContext<T, H>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            maybe = receiver.recv() => match maybe {
                Some(delivery) => {
                    if !process_delivery(shard_id, delivery, &ctx, &mut shutdown).await {
                        tracing::error!(
                            shard_id,
                            "Halting shard worker, exhausted occurrence could not be routed"
                        );
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::info!(shard_id, "Shard worker shutting down");
}

/// Drives one occurrence to a terminal state: invoke, retry with backoff in
/// place (so a later message on this shard cannot overtake), then route.
/// Returns `false` when the occurrence exhausted its retries but could not be
/// routed; the shard must then stop, or later commits would advance the group
/// position past an occurrence that was never forwarded.
async fn process_delivery<T: Transport, H: Handler>(
    shard_id: usize,
    delivery: Delivery,
    ctx: &ShardContext<T, H>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut message = delivery.message;
    loop {
        match ctx.invoker.invoke(&message).await {
            Ok(()) => {
                commit_with_retry(ctx, delivery.checkpoint, shutdown).await;
                emit(ctx, &message, message.attempt + 1, Outcome::Handled);
                return true;
            }
            Err(failure) => {
                let attempts_made = failure.attempt;
                match ctx.retry_policy.decide(attempts_made) {
                    RetryDecision::Retry(delay) => {
                        tracing::info!(
                            shard_id,
                            error = %failure.reason,
                            attempt = attempts_made,
                            "Handler failed, retrying"
                        );
                        message.attempt = attempts_made;
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => {
                                tracing::info!(shard_id, "Abandoning in-flight retry on shutdown");
                                return true;
                            }
                        }
                    }
                    RetryDecision::Exhausted => {
                        match ctx.router.route(failure, shutdown).await {
                            Ok(outcome) => {
                                commit_with_retry(ctx, delivery.checkpoint, shutdown).await;
                                let outcome = match outcome {
                                    RoutingOutcome::Forwarded => Outcome::DeadLettered,
                                    RoutingOutcome::Suppressed => Outcome::Suppressed,
                                };
                                emit(ctx, &message, attempts_made, outcome);
                                return true;
                            }
                            Err(e) => {
                                tracing::error!(
                                    shard_id,
                                    error = %e,
                                    "Dead-letter publish failed, leaving checkpoint uncommitted"
                                );
                                return false;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// A commit that cannot be completed is given up on after a bounded number of
/// attempts: the occurrence already reached its terminal outcome, so the worst
/// case is a duplicate delivery after restart.
async fn commit_with_retry<T: Transport, H>(
    ctx: &ShardContext<T, H>,
    checkpoint: Checkpoint,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut attempts = 0u32;
    loop {
        let commit = ctx.transport.commit(&ctx.topic, &ctx.group_id, checkpoint);
        let result = match tokio::time::timeout(ctx.per_attempt_timeout, commit).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        match result {
            Ok(()) => return,
            Err(e) => {
                attempts += 1;
                match ctx.transport_retry.decide(attempts) {
                    RetryDecision::Retry(delay) => {
                        tracing::warn!(error = %e, "Commit failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => {
                                tracing::info!(?checkpoint, "Abandoning commit on shutdown");
                                return;
                            }
                        }
                    }
                    RetryDecision::Exhausted => {
                        tracing::error!(error = %e, ?checkpoint, "Giving up committing checkpoint");
                        return;
                    }
                }
            }
        }
    }
}

fn emit<T, H>(ctx: &ShardContext<T, H>, message: &Message, attempts: u32, outcome: Outcome) {
    let _ = ctx.events.send(TerminalEvent {
        reference: message.payload.reference.clone(),
        key: message.key.clone(),
        attempts,
        outcome,
    });
}
