//! Core data model: jobs, sub-tasks, evidence, and the provider registry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Overall status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job rows are written but no dispatch command has been handed off yet.
    Pending,
    /// At least one sub-task is outstanding.
    InProgress,
    /// Every sub-task completed.
    Completed,
    /// Some sub-tasks completed, others failed or timed out.
    PartialSuccess,
    /// No sub-task completed and at least one failed.
    Failed,
    /// Cancelled by an administrator; later sub-task outcomes are ignored.
    Cancelled,
    /// No sub-task completed and the deadline passed for the rest.
    Timeout,
}

impl JobStatus {
    /// Check if this is a terminal status. Terminal jobs accept no further
    /// aggregation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartialSuccess | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "partial_success" => Some(Self::PartialSuccess),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single sub-task.
///
/// Transitions are monotonic: once terminal, the store rejects every further
/// mutation, so duplicate or late callbacks are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl SubTaskStatus {
    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Check if the sub-task is still waiting on its provider.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    /// All sub-task statuses, for exhaustive table tests.
    pub const ALL: [SubTaskStatus; 6] = [
        Self::Pending,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Timeout,
    ];
}

impl std::fmt::Display for SubTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Closed registry of orchestratable providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderId {
    /// General-purpose analysis agent.
    UniversalAgent,
    /// Long-form article reader.
    DeepReader,
    /// Breadth-first headline scout.
    Scout,
    /// Cheap local model for quick passes.
    LocalQuick,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UniversalAgent => "UNIVERSAL_AGENT",
            Self::DeepReader => "DEEP_READER",
            Self::Scout => "SCOUT",
            Self::LocalQuick => "LOCAL_QUICK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNIVERSAL_AGENT" => Some(Self::UniversalAgent),
            "DEEP_READER" => Some(Self::DeepReader),
            "SCOUT" => Some(Self::Scout),
            "LOCAL_QUICK" => Some(Self::LocalQuick),
            _ => None,
        }
    }

    /// Whether this provider drives a full browser when crawling.
    pub fn requires_browser(&self) -> bool {
        matches!(self, Self::UniversalAgent | Self::DeepReader)
    }

    /// Default callback deadline. Sub-tasks older than this with no callback
    /// are reaped by the timeout sweeper. Overridable via config.
    pub fn default_deadline(&self) -> Duration {
        match self {
            Self::UniversalAgent => Duration::from_secs(600),
            Self::DeepReader => Duration::from_secs(900),
            Self::Scout => Duration::from_secs(300),
            Self::LocalQuick => Duration::from_secs(120),
        }
    }

    pub const ALL: [ProviderId; 4] = [
        Self::UniversalAgent,
        Self::DeepReader,
        Self::Scout,
        Self::LocalQuick,
    ];
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stance of a piece of evidence toward the job topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stance {
    Pro,
    Con,
    Neutral,
}

impl Stance {
    /// Parse a provider-reported stance string. Unrecognized input maps to
    /// `Neutral`; callers log the fallback.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "PRO" => Self::Pro,
            "CON" => Self::Con,
            _ => Self::Neutral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pro => "PRO",
            Self::Con => "CON",
            Self::Neutral => "NEUTRAL",
        }
    }
}

/// Category of the site that produced a piece of evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceCategory {
    News,
    Community,
    Blog,
    Official,
    Academic,
}

impl SourceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::News => "NEWS",
            Self::Community => "COMMUNITY",
            Self::Blog => "BLOG",
            Self::Official => "OFFICIAL",
            Self::Academic => "ACADEMIC",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEWS" => Some(Self::News),
            "COMMUNITY" => Some(Self::Community),
            "BLOG" => Some(Self::Blog),
            "OFFICIAL" => Some(Self::Official),
            "ACADEMIC" => Some(Self::Academic),
            _ => None,
        }
    }
}

/// One logical orchestration request spanning multiple providers.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: Uuid,
    pub topic: String,
    pub context_url: Option<String>,
    pub overall_status: JobStatus,
    pub error_message: Option<String>,
    /// Token minted at submit time; inbound callbacks must echo it.
    #[serde(skip_serializing)]
    pub callback_token: String,
    /// Optimistic-concurrency counter for aggregate writes.
    #[serde(skip_serializing)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job with a fresh id and callback token.
    pub fn new(topic: impl Into<String>, context_url: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            topic: topic.into(),
            context_url,
            overall_status: JobStatus::Pending,
            error_message: None,
            callback_token: mint_callback_token(),
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// One provider-specific unit of work within a job.
#[derive(Debug, Clone, Serialize)]
pub struct SubTask {
    pub sub_task_id: Uuid,
    pub job_id: Uuid,
    pub provider_id: ProviderId,
    pub task_type: String,
    pub status: SubTaskStatus,
    pub result_payload: Option<String>,
    pub error_message: Option<String>,
    /// Administrative retries via `retry_failed`, distinct from transport
    /// retries inside the queue layer.
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubTask {
    /// Create a new pending sub-task for a job.
    pub fn new(job_id: Uuid, provider_id: ProviderId, task_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            sub_task_id: Uuid::new_v4(),
            job_id,
            provider_id,
            task_type: task_type.into(),
            status: SubTaskStatus::Pending,
            result_payload: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// A stance-tagged citation produced by an evidence-capable provider.
/// Append-only: never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct Evidence {
    pub id: Uuid,
    pub sub_task_id: Uuid,
    pub job_id: Uuid,
    pub url: String,
    pub title: String,
    pub stance: Stance,
    pub snippet: Option<String>,
    pub source: Option<String>,
    pub source_category: SourceCategory,
    pub created_at: DateTime<Utc>,
}

/// Command published to the dispatch queue, one per sub-task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchCommand {
    pub job_id: Uuid,
    pub sub_task_id: Uuid,
    pub provider_id: ProviderId,
    pub task_type: String,
    pub topic: String,
    pub context_url: Option<String>,
    pub callback_token: String,
}

/// One raw evidence entry as reported by a provider. Stance and category are
/// free strings here; normalization happens at ingest time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub stance: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_category: Option<String>,
}

/// Inbound completion/failure report for one sub-task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    pub sub_task_id: Uuid,
    pub provider_id: ProviderId,
    /// "COMPLETED" or "FAILED".
    pub status: String,
    #[serde(default)]
    pub result_payload: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub callback_token: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceEntry>,
}

/// Generate an opaque callback token.
fn mint_callback_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_job_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::PartialSuccess.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Timeout.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }

    #[test]
    fn terminal_subtask_statuses() {
        for status in SubTaskStatus::ALL {
            let expected = !matches!(status, SubTaskStatus::Pending | SubTaskStatus::InProgress);
            assert_eq!(status.is_terminal(), expected, "{status}");
        }
    }

    #[test]
    fn status_str_roundtrip() {
        for status in SubTaskStatus::ALL {
            assert_eq!(SubTaskStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::PartialSuccess,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Timeout,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn provider_registry_is_closed() {
        for provider in ProviderId::ALL {
            assert_eq!(ProviderId::parse(provider.as_str()), Some(provider));
        }
        assert_eq!(ProviderId::parse("SOME_NEW_PROVIDER"), None);
    }

    #[test]
    fn stance_parse_defaults_to_neutral() {
        assert_eq!(Stance::parse("PRO"), Stance::Pro);
        assert_eq!(Stance::parse("con"), Stance::Con);
        assert_eq!(Stance::parse(" neutral "), Stance::Neutral);
        assert_eq!(Stance::parse("strongly agree"), Stance::Neutral);
        assert_eq!(Stance::parse(""), Stance::Neutral);
    }

    #[test]
    fn new_job_starts_pending_with_token() {
        let job = Job::new("quantum computing", None);
        assert_eq!(job.overall_status, JobStatus::Pending);
        assert_eq!(job.callback_token.len(), 32);
        assert_eq!(job.version, 0);
        assert!(job.completed_at.is_none());

        let other = Job::new("quantum computing", None);
        assert_ne!(job.callback_token, other.callback_token);
        assert_ne!(job.job_id, other.job_id);
    }

    #[test]
    fn new_subtask_starts_pending() {
        let job = Job::new("topic", None);
        let sub = SubTask::new(job.job_id, ProviderId::Scout, "analysis");
        assert_eq!(sub.status, SubTaskStatus::Pending);
        assert_eq!(sub.job_id, job.job_id);
        assert_eq!(sub.retry_count, 0);
    }

    #[test]
    fn dispatch_command_serde_roundtrip() {
        let cmd = DispatchCommand {
            job_id: Uuid::new_v4(),
            sub_task_id: Uuid::new_v4(),
            provider_id: ProviderId::DeepReader,
            task_type: "deep_search".into(),
            topic: "semiconductor exports".into(),
            context_url: Some("https://example.com/seed".into()),
            callback_token: "tok".into(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("DEEP_READER"));
        let parsed: DispatchCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.sub_task_id, cmd.sub_task_id);
        assert_eq!(parsed.provider_id, ProviderId::DeepReader);
    }

    #[test]
    fn callback_request_accepts_minimal_body() {
        let json = serde_json::json!({
            "subTaskId": Uuid::new_v4(),
            "providerId": "SCOUT",
            "status": "COMPLETED",
            "callbackToken": "tok",
        });
        let req: CallbackRequest = serde_json::from_value(json).unwrap();
        assert!(req.evidence.is_empty());
        assert!(req.result_payload.is_none());
    }

    #[test]
    fn provider_helpers() {
        assert!(ProviderId::UniversalAgent.requires_browser());
        assert!(!ProviderId::LocalQuick.requires_browser());
        assert!(
            ProviderId::DeepReader.default_deadline() > ProviderId::LocalQuick.default_deadline()
        );
    }
}
