use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::credentials::PlatformHealth;
use crate::error::Result;
use crate::queue::QueueDepth;
use crate::session::model::{ScrapeSession, SessionFilter, SessionStatus};
use crate::session::orchestrator::SessionOrchestrator;

/// Sessions and jobs over a trailing window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WindowStats {
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub sessions_terminated: u64,
    pub jobs_found: u64,
    pub jobs_imported: u64,
    pub jobs_skipped: u64,
}

impl WindowStats {
    fn add(&mut self, session: &ScrapeSession) {
        self.sessions_started += 1;
        match session.status {
            SessionStatus::Completed => self.sessions_completed += 1,
            SessionStatus::Failed => self.sessions_failed += 1,
            SessionStatus::Terminated => self.sessions_terminated += 1,
            SessionStatus::InProgress => {}
        }
        self.jobs_found += session.jobs_found;
        self.jobs_imported += session.jobs_imported;
        self.jobs_skipped += session.jobs_skipped;
    }
}

/// Everything the monitoring dashboard shows on its landing page
#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub active_sessions: u64,
    /// Platforms of live sessions that have not finished yet
    pub active_scrapers: u64,
    /// Entries waiting for review or dispatch
    pub pending_queue_depth: u64,
    pub queue: QueueDepth,
    pub last_24h: WindowStats,
    pub platform_health: Vec<PlatformHealth>,
    pub generated_at: DateTime<Utc>,
}

impl DashboardStats {
    pub async fn collect(orchestrator: &SessionOrchestrator, now: DateTime<Utc>) -> Result<Self> {
        let live = orchestrator
            .list_sessions(&SessionFilter {
                status: Some(SessionStatus::InProgress),
                ..Default::default()
            })
            .await?;

        let mut active_scrapers = 0;
        for session in &live {
            let detail = orchestrator.get_session(&session.session_id).await?;
            active_scrapers += detail
                .platform_statuses
                .iter()
                .filter(|row| !row.status.is_terminal())
                .count() as u64;
        }

        let mut last_24h = WindowStats::default();
        for session in orchestrator
            .list_sessions(&SessionFilter {
                started_after: Some(now - Duration::hours(24)),
                ..Default::default()
            })
            .await?
        {
            last_24h.add(&session);
        }

        let queue = orchestrator.queue().depth().await?;

        Ok(Self {
            active_sessions: live.len() as u64,
            active_scrapers,
            pending_queue_depth: queue.pending + queue.approved,
            queue,
            last_24h,
            platform_health: orchestrator.credential_pool().health().await?,
            generated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialOutcome;
    use crate::platform::Platform;
    use crate::session::PlatformOutcome;
    use crate::test_support::Harness;

    #[tokio::test]
    async fn test_stats_reflect_live_and_recent_sessions() {
        let h = Harness::new(&[Platform::Linkedin, Platform::Glassdoor]);
        h.add_credential(Platform::Linkedin).await;
        h.add_credential(Platform::Glassdoor).await;
        h.approved_entry("role-1", "Austin").await;
        h.approved_entry("role-2", "Austin").await;
        h.queue.enqueue("role-3", "Denver").await.unwrap();

        let id = h.dispatch().await;
        h.orchestrator
            .complete_platform(
                &id,
                Platform::Glassdoor,
                PlatformOutcome::Completed,
                CredentialOutcome::Success,
            )
            .await
            .unwrap();

        let stats = h.orchestrator.stats().await.unwrap();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.active_scrapers, 1);
        assert_eq!(stats.queue.pending, 1);
        assert_eq!(stats.queue.approved, 1);
        assert_eq!(stats.queue.processing, 1);
        assert_eq!(stats.pending_queue_depth, 2);
        assert_eq!(stats.last_24h.sessions_started, 1);
        assert_eq!(stats.platform_health.len(), Platform::ALL.len());

        h.clock.advance(Duration::hours(25));
        let stats = h.orchestrator.stats().await.unwrap();
        assert_eq!(stats.last_24h, WindowStats::default());
    }
}
