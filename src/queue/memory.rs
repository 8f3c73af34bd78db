//! In-memory broker — tokio channels with manual-ack consumer semantics.
//!
//! Topics are created lazily, so messages published before a subscriber
//! attaches are buffered, not lost. A handler failure causes redelivery with
//! exponential backoff; after the retry budget the message moves to the
//! sibling `<topic>.dlq` topic with failure metadata attached.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, error, warn};

use crate::config::RetryPolicy;
use crate::error::QueueError;
use crate::queue::{DeadLetter, HandlerError, MessageHandler, MessageQueue, QueueMessage, dlq_topic};

struct Topic {
    tx: mpsc::UnboundedSender<QueueMessage>,
    /// Taken by the first subscriber; one consumer per topic.
    rx: Mutex<Option<mpsc::UnboundedReceiver<QueueMessage>>>,
    next_offset: AtomicU64,
}

struct BrokerInner {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    retry: RetryPolicy,
}

/// In-memory message broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: RwLock::new(HashMap::new()),
                retry,
            }),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl BrokerInner {
    async fn topic(&self, name: &str) -> Arc<Topic> {
        if let Some(topic) = self.topics.read().await.get(name) {
            return Arc::clone(topic);
        }
        let mut topics = self.topics.write().await;
        Arc::clone(topics.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Topic {
                tx,
                rx: Mutex::new(Some(rx)),
                next_offset: AtomicU64::new(0),
            })
        }))
    }

    async fn send(&self, topic_name: &str, key: &str, payload: serde_json::Value) -> Result<(), QueueError> {
        let topic = self.topic(topic_name).await;
        let offset = topic.next_offset.fetch_add(1, Ordering::SeqCst);
        topic
            .tx
            .send(QueueMessage {
                topic: topic_name.to_string(),
                key: key.to_string(),
                payload,
                attempt: 1,
                offset,
            })
            .map_err(|_| QueueError::TopicClosed(topic_name.to_string()))
    }

    async fn dead_letter(&self, msg: &QueueMessage, last_error: String) {
        let letter = DeadLetter {
            source_topic: msg.topic.clone(),
            offset: msg.offset,
            key: msg.key.clone(),
            payload: msg.payload.clone(),
            attempts: msg.attempt,
            last_error: last_error.clone(),
        };
        let dlq = dlq_topic(&msg.topic);
        error!(
            topic = %msg.topic,
            key = %msg.key,
            offset = msg.offset,
            attempts = msg.attempt,
            error = %last_error,
            "Message dead-lettered"
        );
        let payload = match serde_json::to_value(&letter) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to serialize dead letter");
                return;
            }
        };
        if let Err(e) = self.send(&dlq, &letter.key, payload).await {
            error!(topic = %dlq, error = %e, "Failed to publish dead letter");
        }
    }
}

#[async_trait]
impl MessageQueue for InMemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<(), QueueError> {
        debug!(topic = %topic, key = %key, "Publishing message");
        self.inner.send(topic, key, payload).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), QueueError> {
        let topic_handle = self.inner.topic(topic).await;
        let mut rx = topic_handle
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| QueueError::AlreadySubscribed(topic.to_string()))?;

        let inner = Arc::clone(&self.inner);
        let topic_name = topic.to_string();
        tokio::spawn(async move {
            while let Some(mut msg) = rx.recv().await {
                // Manual ack: the message is only consumed once the handler
                // returns Ok. Everything else redelivers or dead-letters.
                loop {
                    match handler.handle(&msg).await {
                        Ok(()) => break,
                        Err(HandlerError::Fatal(reason)) => {
                            inner.dead_letter(&msg, reason).await;
                            break;
                        }
                        Err(HandlerError::Retryable(reason)) => {
                            if msg.attempt >= inner.retry.max_attempts {
                                inner.dead_letter(&msg, reason).await;
                                break;
                            }
                            let delay = inner.retry.delay_for_attempt(msg.attempt);
                            warn!(
                                topic = %msg.topic,
                                key = %msg.key,
                                attempt = msg.attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %reason,
                                "Handler failed, redelivering after backoff"
                            );
                            tokio::time::sleep(delay).await;
                            msg.attempt += 1;
                        }
                    }
                }
            }
            debug!(topic = %topic_name, "Consumer loop ended");
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(5),
            multiplier: 2.0,
            max_interval: Duration::from_millis(20),
            max_attempts,
        }
    }

    /// Handler that fails the first `failures` deliveries, then succeeds,
    /// reporting every delivery on a channel.
    struct FlakyHandler {
        failures: u32,
        seen: AtomicU32,
        delivered: UnboundedSender<QueueMessage>,
        fatal: bool,
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(&self, msg: &QueueMessage) -> Result<(), HandlerError> {
            let n = self.seen.fetch_add(1, Ordering::SeqCst);
            let _ = self.delivered.send(msg.clone());
            if n < self.failures {
                if self.fatal {
                    Err(HandlerError::Fatal("poison".into()))
                } else {
                    Err(HandlerError::Retryable("transient".into()))
                }
            } else {
                Ok(())
            }
        }
    }

    fn flaky(
        failures: u32,
        fatal: bool,
    ) -> (Arc<FlakyHandler>, mpsc::UnboundedReceiver<QueueMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(FlakyHandler {
                failures,
                seen: AtomicU32::new(0),
                delivered: tx,
                fatal,
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn publish_then_subscribe_buffers() {
        let broker = InMemoryBroker::new(fast_retry(3));
        broker
            .publish("t", "k1", serde_json::json!({"n": 1}))
            .await
            .unwrap();

        let (handler, mut rx) = flaky(0, false);
        broker.subscribe("t", handler).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.key, "k1");
        assert_eq!(msg.attempt, 1);
        assert_eq!(msg.offset, 0);
    }

    #[tokio::test]
    async fn retryable_failure_redelivers_until_success() {
        let broker = InMemoryBroker::new(fast_retry(5));
        let (handler, mut rx) = flaky(2, false);
        broker.subscribe("t", handler).await.unwrap();
        broker.publish("t", "k", serde_json::json!({})).await.unwrap();

        let attempts: Vec<u32> = vec![
            rx.recv().await.unwrap().attempt,
            rx.recv().await.unwrap().attempt,
            rx.recv().await.unwrap().attempt,
        ];
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_with_metadata() {
        let broker = InMemoryBroker::new(fast_retry(2));
        let (handler, _rx) = flaky(u32::MAX, false);
        broker.subscribe("t", handler).await.unwrap();

        let (dlq_handler, mut dlq_rx) = flaky(0, false);
        broker.subscribe("t.dlq", dlq_handler).await.unwrap();

        broker
            .publish("t", "poison", serde_json::json!({"bad": true}))
            .await
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), dlq_rx.recv())
            .await
            .expect("dead letter should arrive")
            .unwrap();
        let letter: DeadLetter = serde_json::from_value(msg.payload).unwrap();
        assert_eq!(letter.source_topic, "t");
        assert_eq!(letter.key, "poison");
        assert_eq!(letter.attempts, 2);
        assert_eq!(letter.last_error, "transient");
        assert_eq!(letter.payload["bad"], true);
    }

    #[tokio::test]
    async fn fatal_failure_dead_letters_immediately() {
        let broker = InMemoryBroker::new(fast_retry(10));
        let (handler, _rx) = flaky(u32::MAX, true);
        broker.subscribe("t", handler).await.unwrap();

        let (dlq_handler, mut dlq_rx) = flaky(0, false);
        broker.subscribe("t.dlq", dlq_handler).await.unwrap();

        broker.publish("t", "k", serde_json::json!({})).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), dlq_rx.recv())
            .await
            .expect("dead letter should arrive")
            .unwrap();
        let letter: DeadLetter = serde_json::from_value(msg.payload).unwrap();
        // No retries happened first.
        assert_eq!(letter.attempts, 1);
        assert_eq!(letter.last_error, "poison");
    }

    #[tokio::test]
    async fn second_subscriber_rejected() {
        let broker = InMemoryBroker::default();
        let (a, _rx_a) = flaky(0, false);
        let (b, _rx_b) = flaky(0, false);
        broker.subscribe("t", a).await.unwrap();
        let err = broker.subscribe("t", b).await.unwrap_err();
        assert!(matches!(err, QueueError::AlreadySubscribed(_)));
    }

    #[tokio::test]
    async fn offsets_are_sequential_per_topic() {
        let broker = InMemoryBroker::default();
        broker.publish("a", "k1", serde_json::json!({})).await.unwrap();
        broker.publish("a", "k2", serde_json::json!({})).await.unwrap();
        broker.publish("b", "k3", serde_json::json!({})).await.unwrap();

        let (handler, mut rx) = flaky(0, false);
        broker.subscribe("a", handler).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().offset, 0);
        assert_eq!(rx.recv().await.unwrap().offset, 1);

        let (handler_b, mut rx_b) = flaky(0, false);
        broker.subscribe("b", handler_b).await.unwrap();
        assert_eq!(rx_b.recv().await.unwrap().offset, 0);
    }
}
