//! Fan-out: job submission and administrative re-dispatch.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{DispatchError, Error, JobError, Result};
use crate::model::{DispatchCommand, Job, JobStatus, ProviderId, SubTask, SubTaskStatus};

use super::Orchestrator;

impl Orchestrator {
    /// Submit a new job fanning out to `providers`.
    ///
    /// The job and its sub-tasks are created atomically before this returns;
    /// the per-provider queue publishes happen concurrently in the
    /// background, each independent of its siblings. The job id is
    /// immediately pollable.
    pub async fn submit(
        self: &Arc<Self>,
        topic: impl Into<String>,
        context_url: Option<String>,
        task_type: impl Into<String>,
        providers: Vec<ProviderId>,
    ) -> Result<Uuid> {
        if providers.is_empty() {
            return Err(Error::Dispatch(DispatchError::EmptyProviderList));
        }

        let topic = topic.into();
        let task_type = task_type.into();
        let job = Job::new(topic, context_url);
        let sub_tasks: Vec<SubTask> = providers
            .iter()
            .map(|provider| SubTask::new(job.job_id, *provider, task_type.clone()))
            .collect();

        self.store().create_job(&job, &sub_tasks).await?;
        info!(
            job_id = %job.job_id,
            providers = sub_tasks.len(),
            topic = %job.topic,
            "Job submitted"
        );

        // Fire-and-forget fan-out: a slow or failed publish for one provider
        // never blocks or fails a sibling.
        let job_id = job.job_id;
        for sub in sub_tasks {
            let this = Arc::clone(self);
            let token = job.callback_token.clone();
            tokio::spawn(async move {
                this.dispatch_subtask(&sub, token).await;
            });
        }

        Ok(job_id)
    }

    /// Re-dispatch a job's failed and timed-out sub-tasks, leaving completed
    /// ones untouched. Explicitly administrative: the sweeper never calls
    /// this.
    pub async fn retry_failed(self: &Arc<Self>, job_id: Uuid) -> Result<usize> {
        let job = self
            .store()
            .get_job(job_id)
            .await?
            .ok_or(Error::Job(JobError::NotFound(job_id)))?;
        if job.overall_status == JobStatus::Cancelled {
            return Err(Error::Job(JobError::AlreadyTerminal {
                id: job_id,
                status: job.overall_status.to_string(),
            }));
        }

        let to_retry = self.store().subtasks_to_retry(job_id).await?;
        if to_retry.is_empty() {
            return Err(Error::Job(JobError::NothingToRetry(job_id)));
        }

        let mut reset = Vec::new();
        for sub in &to_retry {
            if self.store().reset_subtask_for_retry(sub.sub_task_id).await? {
                reset.push(sub.sub_task_id);
            }
        }

        // The job goes back in progress before any command lands.
        loop {
            let job = self
                .store()
                .get_job(job_id)
                .await?
                .ok_or(Error::Job(JobError::NotFound(job_id)))?;
            if job.overall_status == JobStatus::InProgress {
                break;
            }
            if self
                .store()
                .update_job_status(job_id, JobStatus::InProgress, None, job.version)
                .await?
            {
                break;
            }
        }

        let mut dispatches = Vec::new();
        for sub_task_id in &reset {
            // Re-read for the bumped retry_count; it feeds the publish key.
            if let Some(sub) = self.store().get_subtask(*sub_task_id).await? {
                let this = Arc::clone(self);
                let token = job.callback_token.clone();
                dispatches.push(async move {
                    this.dispatch_subtask(&sub, token).await;
                });
            }
        }
        join_all(dispatches).await;

        info!(job_id = %job_id, retried = reset.len(), "Failed sub-tasks re-dispatched");
        Ok(reset.len())
    }

    /// Publish one dispatch command. On successful hand-off the sub-task
    /// (and, for the first one, the job) moves in progress; on exhausted
    /// producer retries the sub-task is marked failed right here — no
    /// callback will ever arrive for it.
    pub(crate) async fn dispatch_subtask(&self, sub: &SubTask, callback_token: String) {
        let job = match self.store().get_job(sub.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                error!(sub_task_id = %sub.sub_task_id, "Dispatch for unknown job");
                return;
            }
            Err(e) => {
                error!(sub_task_id = %sub.sub_task_id, error = %e, "Dispatch read failed");
                return;
            }
        };
        let command = DispatchCommand {
            job_id: sub.job_id,
            sub_task_id: sub.sub_task_id,
            provider_id: sub.provider_id,
            task_type: sub.task_type.clone(),
            topic: job.topic,
            context_url: job.context_url,
            callback_token,
        };

        // retry_count in the key makes an administrative re-dispatch a new
        // logical message while keeping producer-side retries idempotent.
        let key = format!("{}:{}", sub.sub_task_id, sub.retry_count);
        let topic = self.config().dispatch_topic.clone();

        match self.producer().publish(&topic, &key, &command).await {
            Ok(()) => {
                if let Err(e) = self.store().mark_subtask_in_progress(sub.sub_task_id).await {
                    error!(sub_task_id = %sub.sub_task_id, error = %e, "Failed to mark sub-task in progress");
                }
                if let Err(e) = self.store().mark_job_in_progress(sub.job_id).await {
                    error!(job_id = %sub.job_id, error = %e, "Failed to mark job in progress");
                }
            }
            Err(e) => {
                error!(
                    sub_task_id = %sub.sub_task_id,
                    provider = %sub.provider_id,
                    error = %e,
                    "Dispatch publish failed, marking sub-task failed"
                );
                match self
                    .store()
                    .finish_subtask(
                        sub.sub_task_id,
                        SubTaskStatus::Failed,
                        None,
                        Some(&format!("dispatch failed: {e}")),
                    )
                    .await
                {
                    Ok(true) => {
                        if let Err(e) = self.apply_aggregate(sub.job_id).await {
                            error!(job_id = %sub.job_id, error = %e, "Aggregate after dispatch failure");
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        error!(sub_task_id = %sub.sub_task_id, error = %e, "Failed to record dispatch failure");
                    }
                }
            }
        }
    }
}
