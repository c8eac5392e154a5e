//! Processing lock service.
//!
//! Advisory and coarse: the lock is "some job is processing under a live
//! lease". Two callers that both observe `locked = false` at the same instant
//! can both proceed; only `claim`'s conditional update keeps them from taking
//! the same job.

use std::sync::Arc;

use tracing::debug;

use storyforge_core::Clock;
use storyforge_jobs::{LockAction, LockResult};

use super::error::JobError;
use super::store::JobStore;

pub struct ProcessingLock<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore> ProcessingLock<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Report whether a sweep is already running.
    ///
    /// `locked = false` grants the caller the right to start one; the grant is
    /// implicit, since claiming a job is what takes the lock.
    pub async fn acquire(&self, owner_id: &str) -> Result<LockResult, JobError> {
        let result = self.current().await?;
        if result.locked {
            debug!(owner_id, holder = ?result.owner, "processing lock busy");
        } else {
            debug!(owner_id, "processing lock available");
        }
        Ok(result)
    }

    /// No-op: the lock releases itself when the last processing job ends.
    pub async fn release(&self, owner_id: &str) -> Result<LockResult, JobError> {
        debug!(owner_id, "processing lock release requested");
        self.current().await
    }

    pub async fn handle(&self, owner_id: &str, action: LockAction) -> Result<LockResult, JobError> {
        if owner_id.trim().is_empty() {
            return Err(JobError::validation("instanceId must be a non-empty string"));
        }
        match action {
            LockAction::Acquire => self.acquire(owner_id).await,
            LockAction::Release => self.release(owner_id).await,
        }
    }

    /// The holder is the earliest live claim, which the store returns first.
    async fn current(&self) -> Result<LockResult, JobError> {
        let now = self.clock.now();
        let live = self.store.list_live_leases(now, 1).await?;
        Ok(LockResult::from_processing(&live, now))
    }
}
