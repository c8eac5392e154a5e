//! `storyforge-jobs`
//!
//! **Responsibility:** the generation job domain.
//!
//! - `kind`: per-kind profiles (phase tables, ETA rate, retry budget, parameter rules)
//! - `record`: the job record, its status state machine, and field patches
//! - `projection`: the client-facing status view and its cache policy
//! - `retry`: retry eligibility
//! - `lock`: the derived processing lock
//!
//! Nothing here talks to storage; infra applies the patches produced here.

pub mod kind;
pub mod lock;
pub mod projection;
pub mod record;
pub mod retry;

pub use kind::{JobKind, KindProfile, PhaseBand};
pub use lock::{LockAction, LockResult, SYNTHETIC_LOCK_OWNER};
pub use projection::{CachePolicy, FailureView, ProjectedStatus, ResultView};
pub use record::{JobPatch, JobRecord, JobStatus, Outcome, ProgressPatch};
pub use retry::Decision;
