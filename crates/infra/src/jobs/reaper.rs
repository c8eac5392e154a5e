//! Background sweep that reclaims jobs whose worker lease expired.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use storyforge_jobs::Decision;

use super::error::JobError;
use super::lifecycle::JobLifecycleManager;
use super::retry::RetryCoordinator;
use super::store::JobStore;

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Processing jobs failed because their lease ran out.
    pub expired: u64,
    /// Of those, jobs sent back to pending.
    pub requeued: u64,
    /// Of those, jobs with no retries left.
    pub exhausted: u64,
}

/// Reaper runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReaperStats {
    pub sweeps: u64,
    pub expired: u64,
    pub requeued: u64,
    pub exhausted: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

/// Fails processing jobs with dead leases and hands them to the retry
/// coordinator, so a crashed worker neither holds the lock nor strands its job.
pub struct StaleJobReaper<S> {
    lifecycle: Arc<JobLifecycleManager<S>>,
    retry: Arc<RetryCoordinator<S>>,
    batch_size: usize,
}

impl<S: JobStore + 'static> StaleJobReaper<S> {
    pub fn new(lifecycle: Arc<JobLifecycleManager<S>>, retry: Arc<RetryCoordinator<S>>) -> Self {
        Self {
            lifecycle,
            retry,
            batch_size: 500,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run one pass over processing jobs whose lease ran out, earliest
    /// expiry first.
    pub async fn sweep(&self) -> Result<ReapReport, JobError> {
        let mut report = ReapReport::default();
        let expired = self.lifecycle.list_expired(self.batch_size).await?;

        for record in expired {
            let Some(failed) = self.lifecycle.expire_lease(&record).await? else {
                continue;
            };
            report.expired += 1;

            match self.retry.consider_retry(&failed).await {
                Ok(verdict) => match verdict.decision {
                    Decision::Retry => report.requeued += 1,
                    Decision::Exhaust => report.exhausted += 1,
                },
                // Someone else (an operator retry) got there first.
                Err(JobError::Conflict(msg)) => {
                    debug!(job_id = %failed.id, reason = %msg, "retry decision already taken")
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// Spawn the reaper as a tokio task ticking every `interval`.
    pub fn spawn(self, interval: Duration) -> ReaperHandle
    where
        S: Send + Sync,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let stats = Arc::new(Mutex::new(ReaperStats::default()));
        let stats_clone = stats.clone();

        let join = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "stale job reaper started");
            let start_time = Instant::now();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {}
                }

                let result = self.sweep().await;

                let mut s = stats_clone.lock().unwrap_or_else(|p| p.into_inner());
                s.sweeps += 1;
                s.uptime_secs = start_time.elapsed().as_secs();
                match result {
                    Ok(report) => {
                        s.expired += report.expired;
                        s.requeued += report.requeued;
                        s.exhausted += report.exhausted;
                        if report.expired > 0 {
                            warn!(
                                expired = report.expired,
                                requeued = report.requeued,
                                exhausted = report.exhausted,
                                "reclaimed jobs with expired leases"
                            );
                        }
                    }
                    Err(e) => {
                        s.errors += 1;
                        error!(error = %e, "stale job sweep failed");
                    }
                }
            }

            info!("stale job reaper stopped");
        });

        ReaperHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

/// Handle to control a running reaper.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<ReaperStats>>,
}

impl ReaperHandle {
    /// Request graceful shutdown and wait for the current sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.join.await;
    }

    pub fn stats(&self) -> ReaperStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}
