//! Producer-side reliability: bounded retries with fixed backoff and
//! idempotent publish keyed by the caller's idempotency key.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ProducerConfig;
use crate::error::QueueError;
use crate::queue::MessageQueue;

/// Recently published (topic, key) pairs, bounded: once full, the oldest key
/// is forgotten. Duplicate suppression is a window, not a permanent record —
/// a long-running producer must not grow without limit.
struct DedupeWindow {
    seen: HashSet<(String, String)>,
    order: VecDeque<(String, String)>,
    capacity: usize,
}

impl DedupeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, entry: &(String, String)) -> bool {
        self.seen.contains(entry)
    }

    fn insert(&mut self, entry: (String, String)) {
        if !self.seen.insert(entry.clone()) {
            return;
        }
        self.order.push_back(entry);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

/// Reliable publisher wrapping a `MessageQueue`.
///
/// A (topic, key) pair is only handed to the broker once within the dedupe
/// window — retries of a publish that actually succeeded cannot produce
/// duplicate commands. Callers that intend a genuinely new message (e.g. an
/// administrative re-dispatch) use a new key.
pub struct Producer {
    queue: Arc<dyn MessageQueue>,
    config: ProducerConfig,
    published: Mutex<DedupeWindow>,
}

impl Producer {
    pub fn new(queue: Arc<dyn MessageQueue>, config: ProducerConfig) -> Self {
        let window = DedupeWindow::new(config.dedupe_capacity);
        Self {
            queue,
            config,
            published: Mutex::new(window),
        }
    }

    /// Serialize and publish `payload`, retrying transport failures up to the
    /// configured attempt budget.
    pub async fn publish<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        payload: &T,
    ) -> Result<(), QueueError> {
        let entry = (topic.to_string(), key.to_string());
        if self.published.lock().await.contains(&entry) {
            debug!(topic = %topic, key = %key, "Duplicate publish suppressed");
            return Ok(());
        }

        let value = serde_json::to_value(payload)?;
        let mut last_reason = String::new();

        for attempt in 1..=self.config.max_attempts {
            match self.queue.publish(topic, key, value.clone()).await {
                Ok(()) => {
                    self.published.lock().await.insert(entry);
                    return Ok(());
                }
                Err(e) => {
                    last_reason = e.to_string();
                    warn!(
                        topic = %topic,
                        key = %key,
                        attempt,
                        error = %last_reason,
                        "Publish attempt failed"
                    );
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(self.config.retry_backoff).await;
                    }
                }
            }
        }

        Err(QueueError::RetriesExhausted {
            topic: topic.to_string(),
            attempts: self.config.max_attempts,
            reason: last_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::queue::{MessageHandler, QueueMessage};

    /// Queue that fails the first `failures` publishes, then delegates to a
    /// channel.
    struct FlakyQueue {
        failures: AtomicU32,
        sent: mpsc::UnboundedSender<(String, String)>,
    }

    #[async_trait]
    impl MessageQueue for FlakyQueue {
        async fn publish(
            &self,
            topic: &str,
            key: &str,
            _payload: serde_json::Value,
        ) -> Result<(), QueueError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(QueueError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "broker unreachable".into(),
                });
            }
            self.sent.send((topic.to_string(), key.to_string())).unwrap();
            Ok(())
        }

        async fn subscribe(
            &self,
            _topic: &str,
            _handler: Arc<dyn MessageHandler>,
        ) -> Result<(), QueueError> {
            unimplemented!("not used in producer tests")
        }
    }

    fn flaky_queue(failures: u32) -> (Arc<FlakyQueue>, mpsc::UnboundedReceiver<(String, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(FlakyQueue {
                failures: AtomicU32::new(failures),
                sent: tx,
            }),
            rx,
        )
    }

    fn fast_config(max_attempts: u32) -> ProducerConfig {
        ProducerConfig {
            max_attempts,
            retry_backoff: std::time::Duration::from_millis(1),
            ..ProducerConfig::default()
        }
    }

    #[tokio::test]
    async fn publish_retries_past_transient_failures() {
        let (queue, mut rx) = flaky_queue(2);
        let producer = Producer::new(queue, fast_config(3));

        producer
            .publish("t", "k", &serde_json::json!({"v": 1}))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), ("t".to_string(), "k".to_string()));
    }

    #[tokio::test]
    async fn publish_gives_up_after_budget() {
        let (queue, mut rx) = flaky_queue(10);
        let producer = Producer::new(queue, fast_config(3));

        let err = producer
            .publish("t", "k", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::RetriesExhausted { attempts: 3, .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_keys_are_suppressed() {
        let (queue, mut rx) = flaky_queue(0);
        let producer = Producer::new(queue, fast_config(3));

        producer.publish("t", "k", &serde_json::json!({})).await.unwrap();
        producer.publish("t", "k", &serde_json::json!({})).await.unwrap();
        producer.publish("t", "k2", &serde_json::json!({})).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().1, "k");
        assert_eq!(rx.recv().await.unwrap().1, "k2");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dedupe_window_evicts_oldest_key() {
        let (queue, mut rx) = flaky_queue(0);
        let mut config = fast_config(3);
        config.dedupe_capacity = 2;
        let producer = Producer::new(queue, config);

        producer.publish("t", "k1", &serde_json::json!({})).await.unwrap();
        producer.publish("t", "k2", &serde_json::json!({})).await.unwrap();
        // k3 pushes k1 out of the window.
        producer.publish("t", "k3", &serde_json::json!({})).await.unwrap();
        producer.publish("t", "k1", &serde_json::json!({})).await.unwrap();
        // k3 is still remembered.
        producer.publish("t", "k3", &serde_json::json!({})).await.unwrap();

        let sent: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|(_, key)| key)
            .collect();
        assert_eq!(sent, vec!["k1", "k2", "k3", "k1"]);
    }

    #[tokio::test]
    async fn failed_publish_does_not_poison_dedupe() {
        let (queue, mut rx) = flaky_queue(5);
        let producer = Producer::new(queue, fast_config(2));

        // First publish exhausts its budget (2 attempts, 5 failures queued).
        assert!(producer.publish("t", "k", &serde_json::json!({})).await.is_err());
        // A later publish with the same key must still be attempted; the
        // remaining failure budget is 3, so 2 more attempts still fail...
        assert!(producer.publish("t", "k", &serde_json::json!({})).await.is_err());
        // ...and the next one succeeds (1 failure left, 2 attempts).
        producer.publish("t", "k", &serde_json::json!({})).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().1, "k");
    }
}
