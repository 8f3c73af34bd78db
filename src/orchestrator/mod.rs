//! Fan-out/fan-in job orchestration.
//!
//! One `Orchestrator` instance coordinates the whole engine: the dispatcher
//! fans a submitted job out to its providers, the callback ingestor applies
//! inbound completion reports, the aggregator reduces sub-task statuses to
//! one job status, and the timeout sweeper reaps sub-tasks whose provider
//! went silent. All shared state lives in the store.

pub mod aggregator;
mod dispatcher;
mod ingestor;
mod sweeper;


use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::classify::SourceClassifier;
use crate::config::EngineConfig;
use crate::error::{Error, JobError, Result};
use crate::model::{Evidence, Job, JobStatus, SubTask};
use crate::queue::Producer;
use crate::store::JobStore;

pub use ingestor::{CallbackOutcome, CallbackQueueHandler};
pub use sweeper::spawn_sweeper;

/// A job with its sub-tasks and collected evidence, as returned to callers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobDetails {
    #[serde(flatten)]
    pub job: Job,
    pub sub_tasks: Vec<SubTask>,
    pub evidence: Vec<Evidence>,
}

/// The orchestration engine facade.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    producer: Producer,
    classifier: Arc<dyn SourceClassifier>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        producer: Producer,
        classifier: Arc<dyn SourceClassifier>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            producer,
            classifier,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub(crate) fn producer(&self) -> &Producer {
        &self.producer
    }

    pub(crate) fn classifier(&self) -> &Arc<dyn SourceClassifier> {
        &self.classifier
    }

    /// Fetch a job with its sub-tasks and evidence.
    pub async fn get_job(&self, job_id: Uuid) -> Result<JobDetails> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(Error::Job(JobError::NotFound(job_id)))?;
        let sub_tasks = self.store.list_subtasks(job_id).await?;
        let evidence = self.store.list_evidence(job_id).await?;
        Ok(JobDetails {
            job,
            sub_tasks,
            evidence,
        })
    }

    /// List jobs, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        Ok(self.store.list_jobs(status).await?)
    }

    /// Cancel a job. Terminal immediately; in-flight providers keep running
    /// but their late callbacks land on terminal rows and are ignored.
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        loop {
            let job = self
                .store
                .get_job(job_id)
                .await?
                .ok_or(Error::Job(JobError::NotFound(job_id)))?;
            if job.overall_status.is_terminal() {
                return Err(Error::Job(JobError::AlreadyTerminal {
                    id: job_id,
                    status: job.overall_status.to_string(),
                }));
            }
            let swapped = self
                .store
                .update_job_status(
                    job_id,
                    JobStatus::Cancelled,
                    Some("cancelled by administrator"),
                    job.version,
                )
                .await?;
            if swapped {
                break;
            }
            // Lost the version race, re-read and try again.
        }

        let cancelled = self.store.cancel_active_subtasks(job_id).await?;
        tracing::info!(job_id = %job_id, sub_tasks = cancelled, "Job cancelled");
        Ok(())
    }

    /// Recompute the job's overall status from its sub-task statuses and
    /// write it back behind a version check. Serialized per job: a stale
    /// snapshot loses the CAS and the loop re-reads. Terminal jobs are left
    /// alone — that is the cancellation/timeout override.
    pub(crate) async fn apply_aggregate(&self, job_id: Uuid) -> Result<()> {
        loop {
            let Some(job) = self.store.get_job(job_id).await? else {
                warn!(job_id = %job_id, "Aggregate requested for unknown job");
                return Ok(());
            };
            if job.overall_status.is_terminal() {
                return Ok(());
            }

            let sub_tasks = self.store.list_subtasks(job_id).await?;
            let statuses: Vec<_> = sub_tasks.iter().map(|s| s.status).collect();
            let next = aggregator::aggregate(&statuses);
            if next == job.overall_status {
                return Ok(());
            }

            let error_message = match next {
                JobStatus::Failed => Some("all sub-tasks failed"),
                JobStatus::Timeout => Some("deadline exceeded before completion"),
                _ => None,
            };

            let swapped = self
                .store
                .update_job_status(job_id, next, error_message, job.version)
                .await?;
            if swapped {
                tracing::info!(
                    job_id = %job_id,
                    status = %next,
                    "Job status aggregated"
                );
                return Ok(());
            }
        }
    }
}
