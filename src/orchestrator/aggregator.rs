//! Pure status reduction: sub-task status multiset → job status.

use crate::model::{JobStatus, SubTaskStatus};

/// Reduce a job's sub-task statuses to one overall status.
///
/// Total and deterministic over every status multiset. The ordering of the
/// rules is the contract:
/// - anything still active keeps the job in progress;
/// - all completed → completed;
/// - some completed plus terminal failures → partial success;
/// - otherwise the strongest failure signal wins (failed > timeout >
///   cancelled).
///
/// Job-level cancellation and deadline overrides are applied by the caller,
/// not here — a terminal job is never re-aggregated.
pub fn aggregate(statuses: &[SubTaskStatus]) -> JobStatus {
    // A job with no sub-tasks cannot be created through submit; stay pending
    // rather than inventing a terminal outcome.
    if statuses.is_empty() {
        return JobStatus::Pending;
    }

    if statuses.iter().any(|s| s.is_active()) {
        return JobStatus::InProgress;
    }

    let completed = statuses
        .iter()
        .filter(|s| **s == SubTaskStatus::Completed)
        .count();
    if completed == statuses.len() {
        return JobStatus::Completed;
    }
    if completed > 0 {
        return JobStatus::PartialSuccess;
    }
    if statuses.contains(&SubTaskStatus::Failed) {
        return JobStatus::Failed;
    }
    if statuses.contains(&SubTaskStatus::Timeout) {
        return JobStatus::Timeout;
    }
    JobStatus::Cancelled
}
