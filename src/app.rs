use std::sync::Arc;
use tracing::info;

use crate::cli::config::OrchestratorConfig;
use crate::credentials::{CredentialPool, ExponentialBackoff};
use crate::dedup::DedupEngine;
use crate::error::Result;
use crate::queue::RoleLocationQueue;
use crate::session::SessionOrchestrator;
use crate::storage::{Storage, StorageFactory};
use crate::utils::{Clock, SystemClock};

/// The wired-up core: one of each component over a shared storage backend.
#[derive(Clone)]
pub struct AppContext {
    pub config: OrchestratorConfig,
    pub storage: Storage,
    pub pool: Arc<CredentialPool>,
    pub queue: Arc<RoleLocationQueue>,
    pub orchestrator: Arc<SessionOrchestrator>,
}

impl AppContext {
    /// Connect to the configured backend and build every component on it
    pub async fn from_config(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let storage = StorageFactory::create(&config.storage).await?;
        Ok(Self::new(config, storage, Arc::new(SystemClock)))
    }

    pub fn new(config: OrchestratorConfig, storage: Storage, clock: Arc<dyn Clock>) -> Self {
        let pool = Arc::new(CredentialPool::new(
            storage.credentials.clone(),
            Arc::new(ExponentialBackoff::from(&config.pool)),
            clock.clone(),
            config.pool.clone(),
        ));
        let queue = Arc::new(RoleLocationQueue::new(
            storage.queue.clone(),
            clock.clone(),
            config.queue.clone(),
        ));
        let dedup = Arc::new(DedupEngine::new(&config.dedup));

        let orchestrator = Arc::new(SessionOrchestrator::new(
            storage.sessions.clone(),
            storage.postings.clone(),
            pool.clone(),
            queue.clone(),
            dedup,
            clock,
            config.sessions.clone(),
        ));

        info!(
            "Orchestrator ready for platforms: {}",
            config
                .sessions
                .platforms
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Self {
            config,
            storage,
            pool,
            queue,
            orchestrator,
        }
    }
}
