//! Fan-in: validation and application of inbound sub-task callbacks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{CallbackError, Error, Result};
use crate::model::{CallbackRequest, Evidence, SourceCategory, Stance, SubTaskStatus};
use crate::queue::{HandlerError, MessageHandler, QueueMessage};

use super::Orchestrator;

/// What an accepted callback did. Rejections are `CallbackError`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The sub-task transitioned and the job was re-aggregated.
    Applied,
    /// The sub-task was already terminal; accepted so the worker stops
    /// retrying, but nothing changed.
    AlreadyTerminal,
    /// The owning job is already terminal; accepted, nothing changed.
    JobTerminal,
}

impl Orchestrator {
    /// Validate and apply one completion/failure report.
    ///
    /// The idempotency contract: a duplicate or late callback for a terminal
    /// sub-task (or terminal job) is *accepted* — the external worker must
    /// not retry forever — but mutates nothing and appends no evidence.
    pub async fn ingest(&self, request: CallbackRequest) -> Result<CallbackOutcome> {
        self.ingest_inner(None, request).await
    }

    /// HTTP-path variant: the job id from the URL must own the sub-task.
    pub async fn ingest_for_job(
        &self,
        job_id: Uuid,
        request: CallbackRequest,
    ) -> Result<CallbackOutcome> {
        self.ingest_inner(Some(job_id), request).await
    }

    async fn ingest_inner(
        &self,
        expected_job: Option<Uuid>,
        request: CallbackRequest,
    ) -> Result<CallbackOutcome> {
        let sub = self
            .store()
            .get_subtask(request.sub_task_id)
            .await?
            .ok_or(Error::Callback(CallbackError::UnknownSubTask(
                request.sub_task_id,
            )))?;

        // A callback addressed to a job that does not own the sub-task is
        // rejected the same way as an unknown sub-task; the caller learns
        // nothing about other jobs' sub-tasks.
        if expected_job.is_some_and(|expected| expected != sub.job_id) {
            return Err(Error::Callback(CallbackError::UnknownSubTask(
                request.sub_task_id,
            )));
        }

        let job = self
            .store()
            .get_job(sub.job_id)
            .await?
            .ok_or(Error::Callback(CallbackError::UnknownSubTask(
                request.sub_task_id,
            )))?;

        // Token minted at dispatch time; a mismatch is a forged or misrouted
        // completion and mutates nothing.
        if request.callback_token != job.callback_token {
            return Err(Error::Callback(CallbackError::TokenMismatch(job.job_id)));
        }

        let status = match request.status.as_str() {
            "COMPLETED" => SubTaskStatus::Completed,
            "FAILED" => SubTaskStatus::Failed,
            other => {
                return Err(Error::Callback(CallbackError::InvalidStatus(
                    other.to_string(),
                )));
            }
        };

        if job.overall_status.is_terminal() {
            debug!(
                job_id = %job.job_id,
                sub_task_id = %request.sub_task_id,
                "Callback for terminal job ignored"
            );
            return Ok(CallbackOutcome::JobTerminal);
        }

        let mutated = self
            .store()
            .finish_subtask(
                request.sub_task_id,
                status,
                request.result_payload.as_deref(),
                request.error_message.as_deref(),
            )
            .await?;
        if !mutated {
            debug!(
                sub_task_id = %request.sub_task_id,
                "Duplicate callback for terminal sub-task ignored"
            );
            return Ok(CallbackOutcome::AlreadyTerminal);
        }

        if status == SubTaskStatus::Completed {
            self.persist_evidence(&request, job.job_id).await;
        }

        info!(
            job_id = %job.job_id,
            sub_task_id = %request.sub_task_id,
            provider = %request.provider_id,
            status = %status,
            "Callback applied"
        );

        self.apply_aggregate(job.job_id).await?;
        Ok(CallbackOutcome::Applied)
    }

    /// Persist the callback's evidence entries, normalizing stance and
    /// inferring the source category. Only called on an actual transition,
    /// which is what keeps evidence append-only under duplicates.
    ///
    /// Insert failures are logged per entry and do not fail the callback:
    /// the sub-task is already terminal by this point, so a retried callback
    /// would hit the no-op path and the surviving entries would be lost too.
    async fn persist_evidence(&self, request: &CallbackRequest, job_id: Uuid) {
        for entry in &request.evidence {
            let stance = match entry.stance.as_deref() {
                None => Stance::Neutral,
                Some(raw) => {
                    let stance = Stance::parse(raw);
                    if stance == Stance::Neutral && !raw.trim().eq_ignore_ascii_case("neutral") {
                        warn!(
                            sub_task_id = %request.sub_task_id,
                            stance = %raw,
                            "Unrecognized stance, defaulting to NEUTRAL"
                        );
                    }
                    stance
                }
            };

            // Trust a well-formed provider-sent category, otherwise infer
            // from the URL's domain.
            let source_category = entry
                .source_category
                .as_deref()
                .and_then(SourceCategory::parse)
                .unwrap_or_else(|| self.classifier().classify(&entry.url));

            let evidence = Evidence {
                id: Uuid::new_v4(),
                sub_task_id: request.sub_task_id,
                job_id,
                url: entry.url.clone(),
                title: entry.title.clone(),
                stance,
                snippet: entry.snippet.clone(),
                source: entry.source.clone(),
                source_category,
                created_at: Utc::now(),
            };
            if let Err(e) = self.store().insert_evidence(&evidence).await {
                error!(
                    sub_task_id = %request.sub_task_id,
                    url = %entry.url,
                    error = %e,
                    "Failed to persist evidence entry"
                );
            }
        }
    }
}

/// Queue-transport adapter for the ingestor: callbacks arriving on the
/// result topic go through the same `ingest` path as HTTP callbacks.
///
/// Client-error rejects and unparseable payloads are poison, not transient:
/// they dead-letter immediately instead of burning the retry budget. Store
/// errors are transient and redeliver.
pub struct CallbackQueueHandler {
    orchestrator: Arc<Orchestrator>,
}

impl CallbackQueueHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Arc<Self> {
        Arc::new(Self { orchestrator })
    }
}

#[async_trait]
impl MessageHandler for CallbackQueueHandler {
    async fn handle(&self, msg: &QueueMessage) -> std::result::Result<(), HandlerError> {
        let request: CallbackRequest = serde_json::from_value(msg.payload.clone())
            .map_err(|e| HandlerError::Fatal(format!("malformed callback: {e}")))?;

        match self.orchestrator.ingest(request).await {
            Ok(_) => Ok(()),
            Err(Error::Callback(e)) => Err(HandlerError::Fatal(e.to_string())),
            Err(e) => Err(HandlerError::Retryable(e.to_string())),
        }
    }
}
