//! Retry eligibility for failed jobs.
//!
//! Only the decision lives here. Infra applies it with a conditional
//! `failed -> pending` update; nothing schedules when the job runs again.

use serde::Serialize;

use crate::record::{JobRecord, JobStatus};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Send the job back to pending with `retry_count + 1`.
    Retry,
    /// Leave the job failed for good.
    Exhaust,
}

impl Decision {
    /// `Retry` iff the record failed and `retry_count < max_retries`.
    pub fn for_record(record: &JobRecord) -> Self {
        if record.status == JobStatus::Failed && record.retry_count < record.max_retries {
            Decision::Retry
        } else {
            Decision::Exhaust
        }
    }
}
