use std::time::Duration;

/// Retry budget for one message occurrence. `Unlimited` is an explicit opt-in:
/// the occurrence is retried forever and never reaches a terminal routing
/// outcome on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxAttempts {
    Finite(u32),
    Unlimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed { base: Duration },
    Exponential { base: Duration, cap: Duration },
}

#[derive(Debug)]
pub enum ConfigError {
    ZeroMaxAttempts,
    MissingDeadLetterTopic,
    ZeroShards,
    ZeroTimeout,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ZeroMaxAttempts => write!(f, "maxAttempts must be at least 1"),
            ConfigError::MissingDeadLetterTopic => {
                write!(f, "dead-letter topic is required when dead-lettering is enabled")
            }
            ConfigError::ZeroShards => write!(f, "at least one shard worker is required"),
            ConfigError::ZeroTimeout => write!(f, "per-attempt timeout must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Immutable per-listener settings. Validated once at startup; never produces
/// errors at runtime.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub group_id: String,
    pub max_attempts: MaxAttempts,
    pub backoff: Backoff,
    pub dead_letter_enabled: bool,
    pub dead_letter_topic: Option<String>,
    pub per_attempt_timeout: Duration,
    pub num_shards: usize,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            max_attempts: MaxAttempts::Finite(3),
            backoff: Backoff::Exponential {
                base: Duration::from_millis(500),
                cap: Duration::from_millis(2_000),
            },
            dead_letter_enabled: false,
            dead_letter_topic: None,
            per_attempt_timeout: Duration::from_secs(30),
            num_shards: 4,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == MaxAttempts::Finite(0) {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        if self.dead_letter_enabled && self.dead_letter_topic.is_none() {
            return Err(ConfigError::MissingDeadLetterTopic);
        }
        if self.num_shards == 0 {
            return Err(ConfigError::ZeroShards);
        }
        if self.per_attempt_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}
