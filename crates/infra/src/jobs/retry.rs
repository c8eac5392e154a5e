//! Retry coordinator: sole writer of `retry_count`.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use storyforge_core::{Clock, JobId};
use storyforge_jobs::{Decision, JobPatch, JobRecord, JobStatus};

use super::error::JobError;
use super::store::{Expected, JobStore};

/// Decision plus the record as it stands afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryVerdict {
    pub decision: Decision,
    pub record: JobRecord,
}

/// Decides the fate of failed jobs.
///
/// An accepted retry sends the job back to `pending`; the external scheduler
/// decides when it is picked up again. There is no backoff here.
pub struct RetryCoordinator<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore> RetryCoordinator<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Retry iff `retry_count < max_retries`; otherwise the job stays failed.
    ///
    /// The update is conditioned on the record being unchanged since `record`
    /// was read, so two coordinators acting on the same failure cannot both
    /// bump the counter.
    #[instrument(skip(self, record), fields(job_id = %record.id, retry_count = record.retry_count))]
    pub async fn consider_retry(&self, record: &JobRecord) -> Result<RetryVerdict, JobError> {
        if record.status != JobStatus::Failed {
            return Err(JobError::conflict(format!(
                "only failed jobs can be retried; job {} is {}",
                record.id, record.status
            )));
        }

        match Decision::for_record(record) {
            Decision::Exhaust => {
                warn!(
                    job_id = %record.id,
                    retry_count = record.retry_count,
                    max_retries = record.max_retries,
                    "retries exhausted; job stays failed"
                );
                Ok(RetryVerdict {
                    decision: Decision::Exhaust,
                    record: record.clone(),
                })
            }
            Decision::Retry => {
                let patch = JobPatch::retry(record.retry_count + 1, self.clock.now());
                let expected = Expected::status(JobStatus::Failed).unchanged_since(record.updated_at);
                let updated = self.store.update_where(record.id, expected, patch).await?;

                info!(
                    job_id = %record.id,
                    retry_count = updated.retry_count,
                    max_retries = updated.max_retries,
                    "job requeued for retry"
                );
                Ok(RetryVerdict {
                    decision: Decision::Retry,
                    record: updated,
                })
            }
        }
    }

    /// Load the record and decide.
    pub async fn consider_retry_by_id(&self, id: JobId) -> Result<RetryVerdict, JobError> {
        let record = self.store.get(id).await?.ok_or(JobError::NotFound(id))?;
        self.consider_retry(&record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::lifecycle::JobLifecycleManager;
    use crate::jobs::store::InMemoryJobStore;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use storyforge_core::ManualClock;
    use storyforge_jobs::{JobKind, Outcome};

    struct Fixture {
        clock: Arc<ManualClock>,
        manager: JobLifecycleManager<Arc<InMemoryJobStore>>,
        retry: RetryCoordinator<Arc<InMemoryJobStore>>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = InMemoryJobStore::arc();
        Fixture {
            manager: JobLifecycleManager::new(store.clone(), clock.clone(), Duration::minutes(5)),
            retry: RetryCoordinator::new(store, clock.clone()),
            clock,
        }
    }

    async fn run_and_fail(f: &Fixture, id: JobId) -> JobRecord {
        f.manager.claim(id, "worker").await.unwrap();
        f.manager.report_progress(id, "worker", 45, None).await.unwrap();
        f.clock.advance(Duration::seconds(5));
        f.manager
            .finalize(id, Some("worker"), Outcome::Failed { error: "provider timeout".into() })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn failure_cycle_until_retries_exhausted() {
        let f = fixture();
        let job = f
            .manager
            .create(JobKind::Image, json!({"prompt": "a kite"}))
            .await
            .unwrap();
        assert_eq!(job.max_retries, 3);

        for expected_count in 1..=3 {
            let failed = run_and_fail(&f, job.id).await;
            let verdict = f.retry.consider_retry(&failed).await.unwrap();
            assert_eq!(verdict.decision, Decision::Retry);
            assert_eq!(verdict.record.status, JobStatus::Pending);
            assert_eq!(verdict.record.progress, 0);
            assert_eq!(verdict.record.retry_count, expected_count);
            assert!(verdict.record.error_message.is_none());
        }

        let failed = run_and_fail(&f, job.id).await;
        let verdict = f.retry.consider_retry(&failed).await.unwrap();
        assert_eq!(verdict.decision, Decision::Exhaust);

        let record = f.manager.get(job.id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.retry_count, 3);
        assert!(record.retries_exhausted());

        let status = f.manager.get_status(job.id).await.unwrap();
        assert!(status.failure.unwrap().retries_exhausted);
    }

    #[tokio::test]
    async fn double_consideration_of_one_failure_retries_once() {
        let f = fixture();
        let job = f
            .manager
            .create(JobKind::Story, json!({"prompt": "a brave snail"}))
            .await
            .unwrap();
        let failed = run_and_fail(&f, job.id).await;

        f.retry.consider_retry(&failed).await.unwrap();
        let err = f.retry.consider_retry(&failed).await.unwrap_err();
        assert!(matches!(err, JobError::Conflict(_)));
        assert_eq!(f.manager.get(job.id).await.unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn non_failed_jobs_are_rejected() {
        let f = fixture();
        let job = f
            .manager
            .create(JobKind::Scene, json!({"prompt": "rain"}))
            .await
            .unwrap();
        assert!(matches!(
            f.retry.consider_retry_by_id(job.id).await,
            Err(JobError::Conflict(_))
        ));
        let missing = JobId::new();
        assert_eq!(
            f.retry.consider_retry_by_id(missing).await.unwrap_err(),
            JobError::NotFound(missing)
        );
    }
}
