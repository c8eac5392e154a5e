//! The job record, its status state machine, and field-level patches.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storyforge_core::{DomainError, JobId};

use crate::kind::JobKind;

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for a worker to claim it
    Pending,
    /// Claimed by a worker
    Processing,
    /// Finished with a result
    Completed,
    /// Finished with an error (may be sent back to pending by a retry)
    Failed,
    /// Withdrawn externally
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Edges of the lifecycle graph.
    ///
    /// `Failed -> Pending` is only taken on an accepted retry.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Failed, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status '{s}'")))
    }
}

/// How a processing job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Completed { result_ref: String },
    Failed { error: String },
    Cancelled,
}

impl Outcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Outcome::Completed { .. } => JobStatus::Completed,
            Outcome::Failed { .. } => JobStatus::Failed,
            Outcome::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// A unit of asynchronous generation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    /// Kind-specific creation parameters (validated, immutable).
    pub parameters: serde_json::Value,
    pub status: JobStatus,
    /// 0..=100
    pub progress: u8,
    /// Advisory label written by the worker.
    pub current_step: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// First transition into processing; survives retries.
    pub started_at: Option<DateTime<Utc>>,
    /// Transition into completed or failed.
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Produced artifact (e.g. a storybook entry).
    pub result_ref: Option<String>,
    /// Owner token of the current processing lease.
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Fresh pending record; `max_retries` comes from the kind profile.
    pub fn new(id: JobId, kind: JobKind, parameters: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            parameters,
            status: JobStatus::Pending,
            progress: 0,
            current_step: None,
            retry_count: 0,
            max_retries: kind.profile().max_retries,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            result_ref: None,
            worker_id: None,
            lease_expires_at: None,
        }
    }

    /// The outcome a terminal record was finalized with.
    pub fn outcome(&self) -> Option<Outcome> {
        match self.status {
            JobStatus::Completed => Some(Outcome::Completed {
                result_ref: self.result_ref.clone().unwrap_or_default(),
            }),
            JobStatus::Failed => Some(Outcome::Failed {
                error: self.error_message.clone().unwrap_or_default(),
            }),
            JobStatus::Cancelled => Some(Outcome::Cancelled),
            JobStatus::Pending | JobStatus::Processing => None,
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count >= self.max_retries
    }

    /// Whether this record currently holds a live processing lease.
    ///
    /// Records without an expiry (written by older workers) count as live.
    pub fn holds_lease(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.lease_expires_at.is_none_or(|at| at > now)
    }

    /// Apply a patch in place, with the same semantics the SQL backend uses.
    pub fn apply(&mut self, patch: &JobPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        match patch.progress {
            Some(ProgressPatch::Advance(p)) => self.progress = self.progress.max(p.min(100)),
            Some(ProgressPatch::Set(p)) => self.progress = p.min(100),
            None => {}
        }
        if let Some(step) = &patch.current_step {
            self.current_step = step.clone();
        }
        if let Some(count) = patch.retry_count {
            self.retry_count = count;
        }
        if let Some(at) = patch.started_at {
            self.started_at.get_or_insert(at);
        }
        if let Some(at) = patch.completed_at {
            self.completed_at = at;
        }
        if let Some(err) = &patch.error_message {
            self.error_message = err.clone();
        }
        if let Some(result) = &patch.result_ref {
            self.result_ref = result.clone();
        }
        if let Some(worker) = &patch.worker_id {
            self.worker_id = worker.clone();
        }
        if let Some(at) = patch.lease_expires_at {
            self.lease_expires_at = at;
        }
        // Postgres keeps microseconds; one is the smallest visible step.
        self.updated_at = patch.updated_at.max(self.updated_at + chrono::Duration::microseconds(1));
    }
}

/// Progress update mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProgressPatch {
    /// Raise progress to at least this value; never lowers it.
    Advance(u8),
    /// Overwrite (retry reset, completion).
    Set(u8),
}

/// Field-level update applied by the store under a status precondition.
///
/// Outer `None` leaves a field untouched; `Some(None)` clears a nullable field.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<ProgressPatch>,
    pub current_step: Option<Option<String>>,
    pub retry_count: Option<u32>,
    /// Only written when the record has no `started_at` yet.
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub error_message: Option<Option<String>>,
    pub result_ref: Option<Option<String>>,
    pub worker_id: Option<Option<String>>,
    pub lease_expires_at: Option<Option<DateTime<Utc>>>,
    /// Every applied patch strictly advances `updated_at`, so it doubles as a
    /// version for `unchanged_since` preconditions.
    pub updated_at: DateTime<Utc>,
}

impl JobPatch {
    /// A patch that only bumps `updated_at`.
    pub fn touch(now: DateTime<Utc>) -> Self {
        Self {
            status: None,
            progress: None,
            current_step: None,
            retry_count: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            result_ref: None,
            worker_id: None,
            lease_expires_at: None,
            updated_at: now,
        }
    }

    /// pending -> processing under a lease owned by `worker_id`.
    pub fn claim(worker_id: &str, now: DateTime<Utc>, lease_until: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            started_at: Some(now),
            worker_id: Some(Some(worker_id.to_string())),
            lease_expires_at: Some(Some(lease_until)),
            ..Self::touch(now)
        }
    }

    /// Worker progress report; also renews the lease.
    pub fn progress(
        progress: u8,
        current_step: Option<String>,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Self {
        Self {
            progress: Some(ProgressPatch::Advance(progress)),
            current_step: current_step.map(Some),
            lease_expires_at: Some(Some(lease_until)),
            ..Self::touch(now)
        }
    }

    /// Lease renewal without a progress change.
    pub fn heartbeat(now: DateTime<Utc>, lease_until: DateTime<Utc>) -> Self {
        Self {
            lease_expires_at: Some(Some(lease_until)),
            ..Self::touch(now)
        }
    }

    /// Transition into the terminal state described by `outcome`.
    pub fn finalize(outcome: &Outcome, now: DateTime<Utc>) -> Self {
        let base = Self {
            status: Some(outcome.status()),
            worker_id: Some(None),
            lease_expires_at: Some(None),
            ..Self::touch(now)
        };
        match outcome {
            Outcome::Completed { result_ref } => Self {
                progress: Some(ProgressPatch::Set(100)),
                completed_at: Some(Some(now)),
                result_ref: Some(Some(result_ref.clone())),
                error_message: Some(None),
                ..base
            },
            Outcome::Failed { error } => Self {
                completed_at: Some(Some(now)),
                error_message: Some(Some(error.clone())),
                ..base
            },
            Outcome::Cancelled => base,
        }
    }

    /// failed -> pending with the next retry count.
    pub fn retry(next_retry_count: u32, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            progress: Some(ProgressPatch::Set(0)),
            current_step: Some(None),
            retry_count: Some(next_retry_count),
            completed_at: Some(None),
            error_message: Some(None),
            worker_id: Some(None),
            lease_expires_at: Some(None),
            ..Self::touch(now)
        }
    }
}
