use bytes::Bytes;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header carrying the failure reason when a message is dead-lettered.
pub const HEADER_DEATH_REASON: &str = "x-death-reason";
/// Header carrying the topic the message originally arrived on.
pub const HEADER_ORIGINAL_TOPIC: &str = "x-original-topic";
/// Header carrying the number of attempts made before dead-lettering.
pub const HEADER_ATTEMPTS: &str = "x-attempts";

#[derive(Debug)]
pub enum CodecError {
    Json(serde_json::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Json(e) => write!(f, "JSON codec error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub reference: String,
    pub amount: Decimal,
    #[serde(rename = "correlationId")]
    pub correlation_id: uuid::Uuid,
}

impl Payment {
    pub fn new(reference: impl Into<String>, amount: Decimal) -> Self {
        Self {
            reference: reference.into(),
            amount,
            correlation_id: uuid::Uuid::new_v4(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let json = serde_json::to_vec(self).map_err(CodecError::Json)?;
        Ok(Bytes::from(json))
    }

    pub fn decode(bytes: &[u8]) -> Result<Payment, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Json)
    }
}

/// One unit of consumption. `attempt` counts completed handler invocations for
/// this occurrence and only ever grows; a redelivery after restart is a fresh
/// occurrence starting back at zero.
#[derive(Debug, Clone)]
pub struct Message {
    pub key: String,
    pub payload: Payment,
    pub headers: HashMap<String, String>,
    pub attempt: u32,
}

impl Message {
    pub fn new(key: impl Into<String>, payload: Payment) -> Self {
        Self {
            key: key.into(),
            payload,
            headers: HashMap::new(),
            attempt: 0,
        }
    }
}
