//! Error taxonomy surfaced by the job services.

use thiserror::Error;

use storyforge_core::{DomainError, JobId};

use super::store::StoreError;
use crate::config::ConfigError;

/// Typed failure returned to the boundary layer.
///
/// Nothing here is retried internally; only job outcomes are retried, and
/// only through the retry coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Store credentials missing/invalid or the store is unreachable.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Malformed input; the message names the violated constraint.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The record was not in the expected prior state; the caller must abandon
    /// its attempt rather than overwrite.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(String),
}

impl JobError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => JobError::NotFound(id),
            StoreError::AlreadyExists(_)
            | StoreError::Conflict { .. }
            | StoreError::StaleVersion(_)
            | StoreError::LeaseNotOwned(_)
            | StoreError::LeaseActive(_) => JobError::Conflict(err.to_string()),
            StoreError::Unavailable(msg) => JobError::Configuration(msg),
            StoreError::Storage(msg) => JobError::Store(msg),
        }
    }
}

impl From<DomainError> for JobError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => JobError::Validation(msg),
            DomainError::Conflict(msg) => JobError::Conflict(msg),
        }
    }
}

impl From<ConfigError> for JobError {
    fn from(err: ConfigError) -> Self {
        JobError::Configuration(err.to_string())
    }
}
