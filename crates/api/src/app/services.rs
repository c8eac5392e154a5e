//! Service wiring: one job store shared by the lifecycle manager, the retry
//! coordinator, the processing lock and the reaper.

use std::sync::Arc;

use tracing::info;

use storyforge_core::{Clock, SystemClock};
use storyforge_infra::config::{AppConfig, StoreBackend};
use storyforge_infra::jobs::{
    InMemoryJobStore, JobError, JobLifecycleManager, JobStore, PostgresJobStore, ProcessingLock,
    RetryCoordinator, StaleJobReaper,
};

pub type DynJobStore = Arc<dyn JobStore>;

pub struct AppServices {
    pub config: AppConfig,
    pub jobs: Arc<JobLifecycleManager<DynJobStore>>,
    pub retry: Arc<RetryCoordinator<DynJobStore>>,
    pub lock: ProcessingLock<DynJobStore>,
}

impl AppServices {
    pub fn new(
        config: AppConfig,
        store: DynJobStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, JobError> {
        let lease_ttl = chrono::Duration::from_std(config.lease_ttl)
            .map_err(|e| JobError::Configuration(format!("lease ttl out of range: {e}")))?;

        Ok(Self {
            jobs: Arc::new(JobLifecycleManager::new(store.clone(), clock.clone(), lease_ttl)),
            retry: Arc::new(RetryCoordinator::new(store.clone(), clock.clone())),
            lock: ProcessingLock::new(store, clock),
            config,
        })
    }

    /// Services over a fresh in-memory store and the system clock.
    pub fn in_memory(config: AppConfig) -> Result<Self, JobError> {
        Self::new(config, InMemoryJobStore::arc(), Arc::new(SystemClock))
    }

    /// A reaper sharing these services' store and clock.
    pub fn reaper(&self) -> StaleJobReaper<DynJobStore> {
        StaleJobReaper::new(self.jobs.clone(), self.retry.clone())
    }
}

/// Connect the configured store and build the services over it.
pub async fn build_services(config: AppConfig) -> Result<AppServices, JobError> {
    let store: DynJobStore = match &config.store {
        StoreBackend::InMemory => {
            info!("using in-memory job store; jobs will not survive a restart");
            InMemoryJobStore::arc()
        }
        StoreBackend::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresJobStore::connect(database_url, *max_connections).await?;
            store.ensure_schema().await?;
            info!(max_connections, "connected to postgres job store");
            Arc::new(store)
        }
    };

    AppServices::new(config, store, Arc::new(SystemClock))
}
