//! Backend-agnostic `JobStore` trait.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Evidence, Job, JobStatus, SubTask, SubTaskStatus};

/// Durable state for jobs and their sub-tasks.
///
/// Terminal-state monotonicity is enforced here: the guarded update methods
/// return `false` instead of mutating a row that is already terminal, which
/// is what makes duplicate and late callbacks safe no-ops.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job and its sub-tasks in a single transaction. All rows
    /// start pending.
    async fn create_job(&self, job: &Job, sub_tasks: &[SubTask]) -> Result<(), StoreError>;

    /// Fetch a job by id.
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Fetch a sub-task by id. A sub-task row whose parent job is missing
    /// surfaces as `StoreError::OrphanSubTask`.
    async fn get_subtask(&self, sub_task_id: Uuid) -> Result<Option<SubTask>, StoreError>;

    /// List jobs, newest first, optionally filtered by status.
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError>;

    /// List a job's sub-tasks, oldest first.
    async fn list_subtasks(&self, job_id: Uuid) -> Result<Vec<SubTask>, StoreError>;

    /// Flip a job from pending to in-progress. No-op if it already left
    /// pending.
    async fn mark_job_in_progress(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Flip a sub-task from pending to in-progress once its dispatch command
    /// is handed to the queue. No-op if the row already left pending.
    async fn mark_subtask_in_progress(&self, sub_task_id: Uuid) -> Result<(), StoreError>;

    /// Compare-and-swap the job's overall status. Returns `false` when
    /// `expected_version` is stale; the caller re-reads and retries. This is
    /// what serializes concurrent aggregate writes for the same job.
    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
        expected_version: i64,
    ) -> Result<bool, StoreError>;

    /// Apply a terminal status to a sub-task. Guarded: returns `false`
    /// without mutating when the row is absent or already terminal.
    async fn finish_subtask(
        &self,
        sub_task_id: Uuid,
        status: SubTaskStatus,
        result_payload: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Append one evidence row.
    async fn insert_evidence(&self, evidence: &Evidence) -> Result<(), StoreError>;

    /// List all evidence attached to a job, oldest first.
    async fn list_evidence(&self, job_id: Uuid) -> Result<Vec<Evidence>, StoreError>;

    /// All pending/in-progress sub-tasks across all jobs, for the sweeper.
    async fn list_active_subtasks(&self) -> Result<Vec<SubTask>, StoreError>;

    /// A job's failed and timed-out sub-tasks, for administrative retry.
    async fn subtasks_to_retry(&self, job_id: Uuid) -> Result<Vec<SubTask>, StoreError>;

    /// Reset a failed/timed-out sub-task back to pending and bump its retry
    /// count. Returns `false` if the row is not in a retryable state.
    async fn reset_subtask_for_retry(&self, sub_task_id: Uuid) -> Result<bool, StoreError>;

    /// Mark all of a job's still-active sub-tasks cancelled. Returns the
    /// number of rows changed.
    async fn cancel_active_subtasks(&self, job_id: Uuid) -> Result<usize, StoreError>;
}
