use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use storyforge_core::JobId;
use storyforge_jobs::{Decision, JobRecord, JobStatus, LockAction, ProjectedStatus};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub kind: String,
    #[serde(default = "empty_object")]
    pub parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub worker_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRequest {
    pub worker_id: String,
    pub progress: i64,
    pub current_step: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub worker_id: String,
    pub result_ref: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailRequest {
    pub worker_id: String,
    pub error: String,
    /// Whether the retry coordinator should be consulted; defaults to yes.
    #[serde(default = "yes")]
    pub retryable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub instance_id: String,
    pub action: LockAction,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn yes() -> bool {
    true
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub estimated_completion: DateTime<Utc>,
    pub polling_url: String,
}

impl CreateJobResponse {
    pub fn from_record(record: &JobRecord, polling_url: String) -> Self {
        let minutes = record.kind.profile().estimated_total_minutes();
        Self {
            job_id: record.id,
            status: record.status,
            estimated_completion: record.created_at
                + chrono::Duration::minutes(i64::from(minutes)),
            polling_url,
        }
    }
}

/// Job snapshot after a failure report or retry request, with the retry
/// decision when one was taken.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOutcomeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    pub job: ProjectedStatus,
}
