//! Queue abstraction — the reliability layer between the orchestrator and
//! whatever broker carries dispatch commands and provider results.
//!
//! Orchestration logic only ever sees `MessageQueue` and `MessageHandler`;
//! the in-memory broker is the single concrete adapter and doubles as the
//! test fake.

mod memory;
mod producer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

pub use memory::InMemoryBroker;
pub use producer::Producer;

/// One message as delivered to a consumer.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub topic: String,
    /// Idempotency key chosen by the producer.
    pub key: String,
    pub payload: serde_json::Value,
    /// Delivery attempt, 1-based. Bumped on each redelivery.
    pub attempt: u32,
    /// Per-topic sequence number.
    pub offset: u64,
}

/// How a handler failed, which decides what the broker does next.
#[derive(Debug)]
pub enum HandlerError {
    /// Transient: redeliver after backoff, dead-letter after max attempts.
    Retryable(String),
    /// Permanent (malformed payload, client-error class): dead-letter
    /// immediately, never retried.
    Fatal(String),
}

impl HandlerError {
    pub fn reason(&self) -> &str {
        match self {
            Self::Retryable(reason) | Self::Fatal(reason) => reason,
        }
    }
}

/// Consumer callback. A returned `Ok` acknowledges the message; anything
/// else causes redelivery or dead-lettering — never silent loss.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: &QueueMessage) -> Result<(), HandlerError>;
}

/// Narrow broker interface: publish and subscribe, nothing else.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<(), QueueError>;

    async fn subscribe(
        &self,
        topic: &str,
        handler: std::sync::Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError>;
}

/// Payload republished to `<topic>.dlq` after processing retries are
/// exhausted: the original message plus failure metadata. DLQ messages are
/// only ever replayed manually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub source_topic: String,
    pub offset: u64,
    pub key: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub last_error: String,
}

/// Name of the sibling dead-letter topic.
pub fn dlq_topic(topic: &str) -> String {
    format!("{topic}.dlq")
}
