//! Client-facing status view derived from a job record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use storyforge_core::JobId;

use crate::kind::JobKind;
use crate::record::{JobRecord, JobStatus};

/// What a poller sees for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedStatus {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: u8,
    pub current_step: Option<String>,
    pub current_phase: &'static str,
    /// Minutes; only while processing below 100%.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultView {
    pub result_ref: String,
}

/// Failure details; `retries_exhausted` marks a permanent failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureView {
    pub error: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retries_exhausted: bool,
}

impl ProjectedStatus {
    pub fn from_record(record: &JobRecord) -> Self {
        let profile = record.kind.profile();

        let estimated_time_remaining = (record.status == JobStatus::Processing
            && record.progress < 100)
            .then(|| profile.remaining_minutes(record.progress));

        let result = match (record.status, &record.result_ref) {
            (JobStatus::Completed, Some(result_ref)) => Some(ResultView {
                result_ref: result_ref.clone(),
            }),
            _ => None,
        };

        let failure = (record.status == JobStatus::Failed).then(|| FailureView {
            error: record.error_message.clone().unwrap_or_default(),
            retry_count: record.retry_count,
            max_retries: record.max_retries,
            retries_exhausted: record.retries_exhausted(),
        });

        Self {
            job_id: record.id,
            kind: record.kind,
            status: record.status,
            progress: record.progress,
            current_step: record.current_step.clone(),
            current_phase: profile.phase_for(record.progress),
            estimated_time_remaining,
            created_at: record.created_at,
            updated_at: record.updated_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            result,
            failure,
        }
    }

    /// Terminal snapshots never change again (short of an explicit retry).
    pub fn is_cacheable(&self) -> bool {
        self.status.is_terminal()
    }
}

/// `Cache-Control` policy for status responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub terminal_max_age: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            terminal_max_age: Duration::from_secs(3600),
        }
    }
}

impl CachePolicy {
    /// Non-terminal snapshots must never be cached: a stale one would tell a
    /// poller that work is still running (or finished) when it is not.
    pub fn header_value(&self, status: JobStatus) -> String {
        if status.is_terminal() {
            format!("public, max-age={}", self.terminal_max_age.as_secs())
        } else {
            "no-store, no-cache, must-revalidate".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{JobPatch, Outcome};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn processing_image(progress: u8) -> JobRecord {
        let now = Utc::now();
        let mut r = JobRecord::new(JobId::new(), JobKind::Image, json!({"prompt": "owl"}), now);
        r.apply(&JobPatch::claim("w", now, now + ChronoDuration::minutes(5)));
        r.apply(&JobPatch::progress(progress, Some("rendering".into()), now, now));
        r
    }

    #[test]
    fn processing_projection_has_phase_and_eta() {
        let view = ProjectedStatus::from_record(&processing_image(40));
        assert_eq!(view.current_phase, "Generating illustrations");
        assert_eq!(view.estimated_time_remaining, Some(1));
        assert!(view.result.is_none() && view.failure.is_none());
        assert!(!view.is_cacheable());
    }

    #[test]
    fn pending_projection_has_no_eta() {
        let r = JobRecord::new(JobId::new(), JobKind::Story, json!({"prompt": "x"}), Utc::now());
        let view = ProjectedStatus::from_record(&r);
        assert_eq!(view.current_phase, "Planning story");
        assert!(view.estimated_time_remaining.is_none());
    }

    #[test]
    fn completed_projection_exposes_result_only() {
        let mut r = processing_image(70);
        r.apply(&JobPatch::finalize(
            &Outcome::Completed { result_ref: "storybook/42".into() },
            Utc::now(),
        ));
        let view = ProjectedStatus::from_record(&r);
        assert_eq!(view.result, Some(ResultView { result_ref: "storybook/42".into() }));
        assert!(view.estimated_time_remaining.is_none());
        assert!(view.is_cacheable());

        let body = serde_json::to_value(&view).unwrap();
        assert_eq!(body["result"]["resultRef"], "storybook/42");
        assert!(body.get("estimatedTimeRemaining").is_none());
    }

    #[test]
    fn failed_projection_reports_retry_budget() {
        let mut r = processing_image(10);
        r.retry_count = 3;
        r.apply(&JobPatch::finalize(&Outcome::Failed { error: "nsfw".into() }, Utc::now()));
        let failure = ProjectedStatus::from_record(&r).failure.unwrap();
        assert_eq!(failure.error, "nsfw");
        assert_eq!((failure.retry_count, failure.max_retries), (3, 3));
        assert!(failure.retries_exhausted);
    }

    #[test]
    fn cache_policy_splits_terminal_from_live() {
        let policy = CachePolicy::default();
        assert_eq!(policy.header_value(JobStatus::Completed), "public, max-age=3600");
        assert_eq!(policy.header_value(JobStatus::Cancelled), "public, max-age=3600");
        for live in [JobStatus::Pending, JobStatus::Processing] {
            assert_eq!(policy.header_value(live), "no-store, no-cache, must-revalidate");
        }
    }
}
