//! Job storage interface and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use storyforge_core::JobId;
use storyforge_jobs::{JobPatch, JobRecord, JobStatus};

/// Precondition for a conditional update.
///
/// `status` is always checked. `updated_at`, when set, turns the update into
/// an optimistic version check: it only applies if nothing else touched the
/// record since it was read. `worker_id` pins the write to the current lease
/// owner, and `lease_expired_at` requires the lease to have run out by then.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expected {
    pub status: JobStatus,
    pub updated_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub lease_expired_at: Option<DateTime<Utc>>,
}

impl Expected {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            updated_at: None,
            worker_id: None,
            lease_expired_at: None,
        }
    }

    pub fn unchanged_since(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    pub fn owned_by(mut self, worker_id: &str) -> Self {
        self.worker_id = Some(worker_id.to_string());
        self
    }

    pub fn lease_expired_at(mut self, now: DateTime<Utc>) -> Self {
        self.lease_expired_at = Some(now);
        self
    }

    pub(crate) fn check(&self, record: &JobRecord) -> Result<(), StoreError> {
        if record.status != self.status {
            return Err(StoreError::Conflict {
                id: record.id,
                expected: self.status,
                actual: record.status,
            });
        }
        if self.updated_at.is_some_and(|at| at != record.updated_at) {
            return Err(StoreError::StaleVersion(record.id));
        }
        if let Some(worker_id) = &self.worker_id {
            if record.worker_id.as_deref() != Some(worker_id.as_str()) {
                return Err(StoreError::LeaseNotOwned(record.id));
            }
        }
        if let Some(now) = self.lease_expired_at {
            if !record.lease_expires_at.is_some_and(|at| at <= now) {
                return Err(StoreError::LeaseActive(record.id));
            }
        }
        Ok(())
    }
}

/// Durable table of job records.
///
/// Every state transition goes through `update_where`, which must be atomic:
/// of two racing updates with the same precondition, at most one applies.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Read a record.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Insert a new record; fails if the id already exists.
    async fn insert(&self, record: JobRecord) -> Result<JobRecord, StoreError>;

    /// Apply `patch` iff the record matches `expected`; returns the updated record.
    async fn update_where(
        &self,
        id: JobId,
        expected: Expected,
        patch: JobPatch,
    ) -> Result<JobRecord, StoreError>;

    /// Records in `status`, oldest first.
    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Processing records whose lease ran out by `now`, earliest expiry first.
    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Processing records holding a live lease at `now`, earliest claim first.
    async fn list_live_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Per-status counts.
    async fn stats(&self) -> Result<JobStats, StoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("job {0} was modified concurrently")]
    StaleVersion(JobId),
    #[error("job {0} is leased to another worker")]
    LeaseNotOwned(JobId),
    #[error("job {0} still holds a live lease")]
    LeaseActive(JobId),
    /// The store cannot be reached or is misconfigured.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Storage("in-memory job table lock poisoned".to_string())
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&id).cloned())
    }

    async fn insert(&self, record: JobRecord) -> Result<JobRecord, StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_where(
        &self,
        id: JobId,
        expected: Expected,
        patch: JobPatch,
    ) -> Result<JobRecord, StoreError> {
        // Check and write under one guard: this is the compare-and-swap.
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let record = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        expected.check(record)?;
        record.apply(&patch);
        Ok(record.clone())
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing && !j.holds_lease(now))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.lease_expires_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn list_live_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs.values().filter(|j| j.holds_lease(now)).cloned().collect();

        result.sort_by_key(|j| (j.started_at.unwrap_or(j.updated_at), j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}

#[async_trait::async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        (**self).get(id).await
    }

    async fn insert(&self, record: JobRecord) -> Result<JobRecord, StoreError> {
        (**self).insert(record).await
    }

    async fn update_where(
        &self,
        id: JobId,
        expected: Expected,
        patch: JobPatch,
    ) -> Result<JobRecord, StoreError> {
        (**self).update_where(id, expected, patch).await
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        (**self).list_by_status(status, limit).await
    }

    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        (**self).list_expired_leases(now, limit).await
    }

    async fn list_live_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        (**self).list_live_leases(now, limit).await
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        (**self).stats().await
    }
}
