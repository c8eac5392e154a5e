//! Job lifecycle manager: sole writer of status, timestamps, and leases.

use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use storyforge_core::{Clock, JobId};
use storyforge_jobs::{JobKind, JobPatch, JobRecord, JobStatus, Outcome, ProjectedStatus};

use super::error::JobError;
use super::store::{Expected, JobStats, JobStore, StoreError};

/// Error recorded on jobs whose worker stopped renewing its lease.
pub const LEASE_EXPIRED_ERROR: &str = "worker lease expired before the job finished";

/// Creates jobs, drives their state machine, and projects status for pollers.
///
/// Every transition is a single conditional update against the store, so
/// concurrent callers (other API instances, workers) coordinate through the
/// store alone.
pub struct JobLifecycleManager<S> {
    store: S,
    clock: Arc<dyn Clock>,
    lease_ttl: Duration,
}

impl<S: JobStore> JobLifecycleManager<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, lease_ttl: Duration) -> Self {
        Self {
            store,
            clock,
            lease_ttl,
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Validate parameters and insert a fresh pending record.
    #[instrument(skip(self, parameters), fields(kind = %kind), err)]
    pub async fn create(&self, kind: JobKind, parameters: Value) -> Result<JobRecord, JobError> {
        kind.validate_parameters(&parameters)?;

        let record = JobRecord::new(JobId::new(), kind, parameters, self.clock.now());
        let record = self.store.insert(record).await?;

        info!(job_id = %record.id, kind = %kind, max_retries = record.max_retries, "job created");
        Ok(record)
    }

    pub async fn get(&self, id: JobId) -> Result<JobRecord, JobError> {
        self.store.get(id).await?.ok_or(JobError::NotFound(id))
    }

    /// Poller view: phase, remaining-time estimate, result or failure details.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn get_status(&self, id: JobId) -> Result<ProjectedStatus, JobError> {
        let record = self.get(id).await?;
        Ok(ProjectedStatus::from_record(&record))
    }

    /// pending -> processing under a lease owned by `worker_id`.
    ///
    /// Of several workers racing for the same job exactly one wins; the others
    /// get `Conflict` and must move on.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn claim(&self, id: JobId, worker_id: &str) -> Result<JobRecord, JobError> {
        let worker_id = require_worker(worker_id)?;
        let now = self.clock.now();
        let patch = JobPatch::claim(worker_id, now, now + self.lease_ttl);

        match self
            .store
            .update_where(id, Expected::status(JobStatus::Pending), patch)
            .await
        {
            Ok(record) => {
                info!(job_id = %id, worker_id, attempt = record.retry_count + 1, "job claimed");
                Ok(record)
            }
            Err(StoreError::Conflict { actual, .. }) => Err(JobError::conflict(format!(
                "job {id} cannot be claimed: it is {actual}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Record worker progress. Progress stays below 100 until completion and
    /// never decreases; late, lower reports are absorbed.
    ///
    /// The write is conditioned on `worker_id` still holding the lease, so a
    /// worker that lost its claim cannot touch the attempt that replaced it.
    #[instrument(skip(self, current_step), fields(job_id = %id))]
    pub async fn report_progress(
        &self,
        id: JobId,
        worker_id: &str,
        progress: u8,
        current_step: Option<String>,
    ) -> Result<JobRecord, JobError> {
        if progress >= 100 {
            return Err(JobError::validation(
                "progress must be between 0 and 99 while processing; finalize the job to complete it",
            ));
        }
        let worker_id = require_worker(worker_id)?;

        let now = self.clock.now();
        let patch = JobPatch::progress(progress, current_step, now, now + self.lease_ttl);
        let record = self
            .store
            .update_where(id, Expected::status(JobStatus::Processing).owned_by(worker_id), patch)
            .await?;

        if progress < record.progress {
            debug!(job_id = %id, reported = progress, current = record.progress, "ignoring progress regression");
        }
        debug!(job_id = %id, progress = record.progress, "progress reported");
        Ok(record)
    }

    /// Renew the lease without reporting progress.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn heartbeat(&self, id: JobId, worker_id: &str) -> Result<JobRecord, JobError> {
        let worker_id = require_worker(worker_id)?;

        let now = self.clock.now();
        let record = self
            .store
            .update_where(
                id,
                Expected::status(JobStatus::Processing).owned_by(worker_id),
                JobPatch::heartbeat(now, now + self.lease_ttl),
            )
            .await?;
        Ok(record)
    }

    /// Move a job into the terminal state described by `outcome`.
    ///
    /// `owner` is the reporting worker for completions and failures; the
    /// write then only applies while that worker holds the lease. External
    /// callers (cancellation) pass `None`.
    ///
    /// On an already-terminal record the same outcome is a no-op and a
    /// different one is a `Conflict` that leaves the record untouched. A
    /// result arriving after cancellation, or after the job was handed to
    /// another worker, is discarded this way.
    #[instrument(skip(self), fields(job_id = %id, outcome = %outcome.status()))]
    pub async fn finalize(
        &self,
        id: JobId,
        owner: Option<&str>,
        outcome: Outcome,
    ) -> Result<JobRecord, JobError> {
        validate_outcome(&outcome)?;
        let owner = owner.map(require_worker).transpose()?;

        let record = self.get(id).await?;
        if record.status.is_terminal() {
            return reconcile_terminal(record, &outcome);
        }
        if !record.status.can_transition_to(outcome.status()) {
            return Err(JobError::conflict(format!(
                "job {id} is {}; it cannot become {}",
                record.status,
                outcome.status()
            )));
        }

        let mut expected = Expected::status(record.status);
        if let Some(owner) = owner {
            expected = expected.owned_by(owner);
        }
        let patch = JobPatch::finalize(&outcome, self.clock.now());
        match self.store.update_where(id, expected, patch).await {
            Ok(record) => {
                match &outcome {
                    Outcome::Completed { result_ref } => {
                        info!(job_id = %id, result_ref = %result_ref, "job completed")
                    }
                    Outcome::Failed { error } => warn!(job_id = %id, error = %error, "job failed"),
                    Outcome::Cancelled => info!(job_id = %id, "job cancelled"),
                }
                Ok(record)
            }
            // Another writer moved the record first; judge against what won.
            Err(StoreError::Conflict { .. }) => {
                let current = self.get(id).await?;
                if current.status.is_terminal() {
                    reconcile_terminal(current, &outcome)
                } else {
                    Err(JobError::conflict(format!(
                        "job {id} changed to {} while finalizing",
                        current.status
                    )))
                }
            }
            Err(StoreError::LeaseNotOwned(_)) => {
                warn!(job_id = %id, worker_id = owner.unwrap_or("-"), "discarding outcome from a worker without the lease");
                Err(JobError::conflict(format!(
                    "job {id} is leased to another worker; outcome discarded"
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// External cancellation of a pending or processing job.
    pub async fn cancel(&self, id: JobId) -> Result<JobRecord, JobError> {
        self.finalize(id, None, Outcome::Cancelled).await
    }

    /// Fail a processing record whose lease ran out.
    ///
    /// The write requires the lease to have run out as of now and to still
    /// belong to the worker seen in `record`. Returns `None` otherwise (a late
    /// heartbeat, a finalize, or a re-claim won).
    #[instrument(skip(self, record), fields(job_id = %record.id), err)]
    pub async fn expire_lease(&self, record: &JobRecord) -> Result<Option<JobRecord>, JobError> {
        let now = self.clock.now();
        if record.status != JobStatus::Processing || record.holds_lease(now) {
            return Ok(None);
        }

        let outcome = Outcome::Failed {
            error: LEASE_EXPIRED_ERROR.to_string(),
        };
        let mut expected = Expected::status(JobStatus::Processing).lease_expired_at(now);
        if let Some(worker_id) = record.worker_id.as_deref() {
            expected = expected.owned_by(worker_id);
        }
        match self
            .store
            .update_where(record.id, expected, JobPatch::finalize(&outcome, now))
            .await
        {
            Ok(failed) => {
                warn!(
                    job_id = %record.id,
                    worker_id = record.worker_id.as_deref().unwrap_or("-"),
                    "processing lease expired"
                );
                Ok(Some(failed))
            }
            Err(
                StoreError::Conflict { .. }
                | StoreError::LeaseActive(_)
                | StoreError::LeaseNotOwned(_),
            ) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Processing records whose lease has run out, earliest expiry first.
    pub async fn list_expired(&self, limit: usize) -> Result<Vec<JobRecord>, JobError> {
        Ok(self.store.list_expired_leases(self.clock.now(), limit).await?)
    }

    pub async fn stats(&self) -> Result<JobStats, JobError> {
        Ok(self.store.stats().await?)
    }
}

fn require_worker(worker_id: &str) -> Result<&str, JobError> {
    let worker_id = worker_id.trim();
    if worker_id.is_empty() {
        return Err(JobError::validation("workerId must be a non-empty string"));
    }
    Ok(worker_id)
}

fn validate_outcome(outcome: &Outcome) -> Result<(), JobError> {
    match outcome {
        Outcome::Completed { result_ref } if result_ref.trim().is_empty() => {
            Err(JobError::validation("resultRef must be a non-empty string"))
        }
        Outcome::Failed { error } if error.trim().is_empty() => {
            Err(JobError::validation("error must be a non-empty string"))
        }
        _ => Ok(()),
    }
}

fn reconcile_terminal(record: JobRecord, outcome: &Outcome) -> Result<JobRecord, JobError> {
    if record.outcome().as_ref() == Some(outcome) {
        debug!(job_id = %record.id, "finalize repeated with the same outcome");
        Ok(record)
    } else {
        Err(JobError::conflict(format!(
            "job {} was already finalized as {}",
            record.id, record.status
        )))
    }
}
