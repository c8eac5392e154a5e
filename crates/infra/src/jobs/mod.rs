//! Generation job services: lifecycle, processing lock, retries.
//!
//! ## Components
//!
//! - `JobStore`: persistence with an atomic conditional update (in-memory or Postgres)
//! - `JobLifecycleManager`: create, claim, progress, finalize, cancel
//! - `ProcessingLock`: advisory "is anything running" view derived from records
//! - `RetryCoordinator`: decides what happens after a job fails
//! - `StaleJobReaper`: reclaims jobs whose worker lease ran out

pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod postgres;
pub mod reaper;
pub mod retry;
pub mod store;

pub use error::JobError;
pub use lifecycle::{JobLifecycleManager, LEASE_EXPIRED_ERROR};
pub use lock::ProcessingLock;
pub use postgres::PostgresJobStore;
pub use reaper::{ReapReport, ReaperHandle, ReaperStats, StaleJobReaper};
pub use retry::{RetryCoordinator, RetryVerdict};
pub use store::{Expected, InMemoryJobStore, JobStats, JobStore, StoreError};
