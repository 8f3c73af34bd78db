//! Configuration types.

use std::collections::HashMap;
use std::time::Duration;

use crate::model::ProviderId;

/// Producer-side publish guarantees: bounded retries with fixed backoff.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Total publish attempts before the sub-task is marked failed.
    pub max_attempts: u32,
    /// Fixed delay between publish attempts.
    pub retry_backoff: Duration,
    /// Keys remembered for duplicate suppression, oldest evicted first.
    pub dedupe_capacity: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            dedupe_capacity: 16_384,
        }
    }
}

/// Consumer-side redelivery policy: exponential backoff, then dead-letter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first redelivery.
    pub initial_interval: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Cap on the redelivery delay.
    pub max_interval: Duration,
    /// Processing attempts before the message moves to the DLQ.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before redelivering after `attempt` failures (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let factor = self.multiplier.powi(exp as i32);
        let delay = self.initial_interval.mul_f64(factor.max(1.0));
        delay.min(self.max_interval)
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Topic the dispatcher publishes provider commands to.
    pub dispatch_topic: String,
    /// Topic providers may report results on (HTTP callback is the other
    /// transport).
    pub result_topic: String,
    /// Timeout sweeper cadence.
    pub sweep_interval: Duration,
    /// Per-provider deadline overrides; providers not listed use their
    /// registry default.
    pub provider_deadlines: HashMap<ProviderId, Duration>,
    pub producer: ProducerConfig,
    pub consumer_retry: RetryPolicy,
    /// HTTP bind port.
    pub port: u16,
    /// Database path.
    pub db_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_topic: "jobs.dispatch".to_string(),
            result_topic: "jobs.results".to_string(),
            sweep_interval: Duration::from_secs(30),
            provider_deadlines: HashMap::new(),
            producer: ProducerConfig::default(),
            consumer_retry: RetryPolicy::default(),
            port: 8080,
            db_path: "./data/newsflow.db".to_string(),
        }
    }
}

impl EngineConfig {
    /// Build a config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("NEWSFLOW_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(path) = std::env::var("NEWSFLOW_DB_PATH") {
            config.db_path = path;
        }
        if let Ok(secs) = std::env::var("NEWSFLOW_SWEEP_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse() {
                config.sweep_interval = Duration::from_secs(secs);
            }
        }
        if let Ok(attempts) = std::env::var("NEWSFLOW_CONSUMER_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                config.consumer_retry.max_attempts = attempts;
            }
        }

        config
    }

    /// Callback deadline for a provider, with config override.
    pub fn deadline_for(&self, provider: ProviderId) -> Duration {
        self.provider_deadlines
            .get(&provider)
            .copied()
            .unwrap_or_else(|| provider.default_deadline())
    }
}
