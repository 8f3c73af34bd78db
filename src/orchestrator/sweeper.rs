//! Timeout sweeper — reaps sub-tasks whose provider went silent.
//!
//! Runs on a fixed cadence, independent of request traffic. It only ever
//! moves pending/in-progress rows to timeout (the store's terminal guard
//! makes racing against a landing callback safe) and never retries anything
//! by itself — retry is the administrator's call.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use crate::error::Result;
use crate::model::SubTaskStatus;

use super::Orchestrator;

impl Orchestrator {
    /// One sweep pass: expire every active sub-task older than its
    /// provider's deadline. Returns the number of sub-tasks timed out.
    pub async fn sweep_once(&self) -> Result<usize> {
        let active = self.store().list_active_subtasks().await?;
        let now = Utc::now();
        let mut expired = 0;

        for sub in active {
            let deadline = self.config().deadline_for(sub.provider_id);
            // Age from updated_at so a re-dispatched sub-task gets a fresh
            // deadline window.
            let age = now
                .signed_duration_since(sub.updated_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age <= deadline {
                continue;
            }

            let timed_out = self
                .store()
                .finish_subtask(
                    sub.sub_task_id,
                    SubTaskStatus::Timeout,
                    None,
                    Some("no callback before deadline"),
                )
                .await?;
            if timed_out {
                info!(
                    sub_task_id = %sub.sub_task_id,
                    job_id = %sub.job_id,
                    provider = %sub.provider_id,
                    age_secs = age.as_secs(),
                    "Sub-task timed out"
                );
                expired += 1;
                self.apply_aggregate(sub.job_id).await?;
            }
        }

        Ok(expired)
    }
}

/// Spawn the background sweep task on the configured interval.
pub fn spawn_sweeper(orchestrator: Arc<Orchestrator>) -> tokio::task::JoinHandle<()> {
    let interval = orchestrator.config().sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = orchestrator.sweep_once().await {
                error!(error = %e, "Timeout sweep failed");
            }
        }
    })
}
