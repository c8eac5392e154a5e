//! The processing lock, derived from record state.
//!
//! There is no lock row. The lock is held while any record is processing
//! under a live lease, and disappears when the last one reaches a terminal
//! state or its lease runs out. Per-job exclusion comes from the conditional
//! claim, not from this view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::JobRecord;

/// Owner reported when a processing record carries no worker id.
pub const SYNTHETIC_LOCK_OWNER: &str = "processing";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockAction {
    Acquire,
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResult {
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl LockResult {
    pub fn unlocked() -> Self {
        Self {
            locked: false,
            owner: None,
        }
    }

    /// Derive the lock from the records currently in `processing`.
    ///
    /// Expired leases do not hold the lock. The owner is that of the oldest
    /// live claim.
    pub fn from_processing(records: &[JobRecord], now: DateTime<Utc>) -> Self {
        let holder = records
            .iter()
            .filter(|r| r.holds_lease(now))
            .min_by_key(|r| (r.started_at.unwrap_or(r.updated_at), r.id));

        match holder {
            Some(record) => Self {
                locked: true,
                owner: Some(
                    record
                        .worker_id
                        .clone()
                        .unwrap_or_else(|| SYNTHETIC_LOCK_OWNER.to_string()),
                ),
            },
            None => Self::unlocked(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::JobKind;
    use crate::record::JobPatch;
    use chrono::Duration;
    use serde_json::json;
    use storyforge_core::JobId;

    fn claimed(worker: &str, at: DateTime<Utc>, ttl: Duration) -> JobRecord {
        let mut r = JobRecord::new(JobId::new(), JobKind::Scene, json!({}), at);
        r.apply(&JobPatch::claim(worker, at, at + ttl));
        r
    }

    #[test]
    fn no_processing_records_means_unlocked() {
        assert_eq!(LockResult::from_processing(&[], Utc::now()), LockResult::unlocked());
    }

    #[test]
    fn oldest_live_claim_owns_the_lock() {
        let t0 = Utc::now();
        let records = vec![
            claimed("late", t0 + Duration::seconds(5), Duration::minutes(5)),
            claimed("early", t0, Duration::minutes(5)),
        ];
        let lock = LockResult::from_processing(&records, t0 + Duration::seconds(10));
        assert!(lock.locked);
        assert_eq!(lock.owner.as_deref(), Some("early"));
    }

    #[test]
    fn expired_leases_do_not_hold_the_lock() {
        let t0 = Utc::now();
        let records = vec![claimed("crashed", t0, Duration::seconds(30))];
        let lock = LockResult::from_processing(&records, t0 + Duration::minutes(1));
        assert!(!lock.locked);
    }

    #[test]
    fn anonymous_processing_gets_synthetic_owner() {
        let t0 = Utc::now();
        let mut r = claimed("w", t0, Duration::minutes(1));
        r.worker_id = None;
        r.lease_expires_at = None;
        let lock = LockResult::from_processing(&[r], t0);
        assert_eq!(lock.owner.as_deref(), Some(SYNTHETIC_LOCK_OWNER));
    }
}
