//! Error types for the orchestration engine.

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors from the job/sub-task store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Orphan sub-task {sub_task_id}: parent job {job_id} does not exist")]
    OrphanSubTask { sub_task_id: Uuid, job_id: Uuid },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Message broker / reliability-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Publish to topic {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Publish to topic {topic} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        topic: String,
        attempts: u32,
        reason: String,
    },

    #[error("Topic {0} is closed")]
    TopicClosed(String),

    #[error("Topic {0} already has a subscriber")]
    AlreadySubscribed(String),

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Client errors raised at submit time. Nothing is persisted when these fire.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Provider list must not be empty")]
    EmptyProviderList,

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
}

/// Client errors raised while ingesting a callback. No state is mutated.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("Unknown sub-task: {0}")]
    UnknownSubTask(Uuid),

    #[error("Callback token mismatch for job {0}")]
    TokenMismatch(Uuid),

    #[error("Invalid callback status: {0}")]
    InvalidStatus(String),
}

/// Job administration errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {id} is already terminal ({status})")]
    AlreadyTerminal { id: Uuid, status: String },

    #[error("Job {0} has no failed or timed-out sub-tasks to retry")]
    NothingToRetry(Uuid),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
