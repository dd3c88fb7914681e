//! Shared fixtures for tests that need the whole core wired together.

use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::app::AppContext;
use crate::cli::config::OrchestratorConfig;
use crate::credentials::{CredentialPool, CredentialSecret, ScraperCredential};
use crate::dedup::JobRecord;
use crate::platform::Platform;
use crate::queue::{RoleLocationQueue, RoleLocationQueueEntry};
use crate::session::SessionOrchestrator;
use crate::storage::Storage;
use crate::utils::ManualClock;

pub(crate) struct Harness {
    pub app: AppContext,
    pub clock: ManualClock,
    pub pool: Arc<CredentialPool>,
    pub queue: Arc<RoleLocationQueue>,
    pub orchestrator: Arc<SessionOrchestrator>,
}

impl Harness {
    pub fn new(platforms: &[Platform]) -> Self {
        let mut config = OrchestratorConfig::default();
        config.sessions.platforms = platforms.to_vec();
        Self::with_config(config)
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let clock = ManualClock::new(Utc::now());
        let app = AppContext::new(config, Storage::memory(), Arc::new(clock.clone()));
        Self {
            pool: app.pool.clone(),
            queue: app.queue.clone(),
            orchestrator: app.orchestrator.clone(),
            app,
            clock,
        }
    }

    pub async fn add_credential(&self, platform: Platform) -> ScraperCredential {
        let n = self.pool.list(&Default::default()).await.unwrap().len();
        self.pool
            .create(
                platform,
                "",
                CredentialSecret::Email {
                    email: format!("scraper{}@example.com", n),
                    password: "hunter2".to_string(),
                },
            )
            .await
            .unwrap()
    }

    /// Enqueue and approve; the clock ticks so entries keep FIFO order.
    pub async fn approved_entry(&self, role: &str, location: &str) -> RoleLocationQueueEntry {
        self.clock.advance(Duration::seconds(1));
        let entry = self.queue.enqueue(role, location).await.unwrap();
        self.queue.approve(&entry.id).await.unwrap()
    }

    /// A second orchestrator over the same storage, as another process
    /// would run it
    pub fn peer(&self) -> AppContext {
        AppContext::new(
            self.app.config.clone(),
            self.app.storage.clone(),
            Arc::new(self.clock.clone()),
        )
    }

    /// Dispatch the next entry and return the new session's id
    pub async fn dispatch(&self) -> String {
        self.orchestrator
            .dispatch_next()
            .await
            .unwrap()
            .expect("an approved entry to dispatch")
            .session
            .session_id
    }
}

pub(crate) fn job(external_id: &str, title: &str) -> JobRecord {
    JobRecord {
        external_job_id: Some(external_id.to_string()),
        title: Some(title.to_string()),
        company: Some("Acme".to_string()),
        location: Some("Austin, TX".to_string()),
        description: None,
        job_url: Some(format!("https://jobs.example.com/{}", external_id)),
    }
}
