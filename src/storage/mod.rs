pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::cli::config::{StorageBackend, StorageSettings};
use crate::credentials::{CredentialFilter, ScraperCredential};
use crate::dedup::JobPosting;
use crate::error::Result;
use crate::platform::Platform;
use crate::queue::{QueueFilter, QueueStatus, RoleLocationQueueEntry};
use crate::session::{
    BatchApplication, BatchApply, BatchProgress, JobLogFilter, JobLogSummary, PlatformFinish,
    ScrapeSession, SessionFilter, SessionJobLog, SessionPlatformStatus, SessionStatus,
};

// Re-export common types
pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

/// One-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 50,
        }
    }
}

impl Page {
    pub const MAX_PAGE_SIZE: u32 = 500;

    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        let defaults = Self::default();
        Self {
            page: page.unwrap_or(defaults.page).max(1),
            page_size: page_size
                .unwrap_or(defaults.page_size)
                .clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.page_size as usize
    }

    /// Slice an already-filtered, already-ordered list.
    pub fn apply<T>(&self, items: Vec<T>) -> Paged<T> {
        let total = items.len() as u64;
        let items = items
            .into_iter()
            .skip(self.offset())
            .take(self.page_size as usize)
            .collect();
        Paged {
            items,
            total,
            page: self.page,
            page_size: self.page_size,
        }
    }
}

/// A page of results together with the unpaged total
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Persistence of scraper credentials. Every write after insert is a
/// compare-and-swap on `version`.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn insert_credential(&self, credential: &ScraperCredential) -> Result<()>;

    async fn get_credential(&self, id: &str) -> Result<Option<ScraperCredential>>;

    async fn list_credentials(&self, filter: &CredentialFilter) -> Result<Vec<ScraperCredential>>;

    /// Write `next` only if the stored version still equals `current_version`.
    /// `next.version` must be `current_version + 1`.
    async fn compare_and_swap_credential(
        &self,
        current_version: u64,
        next: &ScraperCredential,
    ) -> Result<bool>;

    async fn delete_credential(&self, id: &str, current_version: u64) -> Result<bool>;
}

/// Persistence of role/location queue entries, with the same CAS contract.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Returns false, writing nothing, when the entry's (role, location)
    /// pair already has an active entry.
    async fn insert_entry(&self, entry: &RoleLocationQueueEntry) -> Result<bool>;

    async fn get_entry(&self, id: &str) -> Result<Option<RoleLocationQueueEntry>>;

    /// Ordered by priority tier, then oldest first.
    async fn list_entries(
        &self,
        filter: &QueueFilter,
        page: Page,
    ) -> Result<Paged<RoleLocationQueueEntry>>;

    /// Every approved entry in dequeue order.
    async fn approved_entries(&self) -> Result<Vec<RoleLocationQueueEntry>>;

    /// The pending/approved/processing entry for a pair, if any.
    async fn find_active_entry(
        &self,
        global_role_id: &str,
        location: &str,
    ) -> Result<Option<RoleLocationQueueEntry>>;

    async fn compare_and_swap_entry(
        &self,
        current_version: u64,
        next: &RoleLocationQueueEntry,
    ) -> Result<bool>;

    async fn delete_entry(&self, id: &str, current_version: u64) -> Result<bool>;

    async fn count_by_status(&self) -> Result<HashMap<QueueStatus, u64>>;
}

/// Persistence of sessions, platform rows, job logs, applied batch keys and
/// batches held for ordering.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(
        &self,
        session: &ScrapeSession,
        platforms: &[SessionPlatformStatus],
    ) -> Result<()>;

    async fn get_session(&self, session_id: &str) -> Result<Option<ScrapeSession>>;

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<ScrapeSession>>;

    async fn platform_statuses(&self, session_id: &str) -> Result<Vec<SessionPlatformStatus>>;

    async fn set_platform_credential(
        &self,
        session_id: &str,
        platform: Platform,
        credential_id: &str,
    ) -> Result<()>;

    /// Insert the batch key, job logs and counter increments in one unit,
    /// only when the platform's `completed_batches` equals the batch index.
    /// Anything else writes nothing.
    async fn apply_batch(&self, batch: &BatchApplication) -> Result<BatchApply>;

    /// Hold a batch that arrived ahead of its predecessor. Returns false
    /// when a batch with that index is already held.
    async fn park_batch(
        &self,
        session_id: &str,
        platform: Platform,
        batch: &BatchProgress,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Remove and return the held batch at `batch_index`, if any. At most
    /// one caller gets it.
    async fn take_parked_batch(
        &self,
        session_id: &str,
        platform: Platform,
        batch_index: u32,
    ) -> Result<Option<BatchProgress>>;

    /// Drop the held batches of one platform, or of every platform when
    /// `platform` is `None`. Returns how many were dropped.
    async fn discard_parked_batches(
        &self,
        session_id: &str,
        platform: Option<Platform>,
    ) -> Result<u64>;

    /// Move a non-terminal platform to a terminal status and bump the
    /// session's completed/failed platform counter. Returns false when the
    /// platform was already terminal.
    async fn finish_platform(&self, finish: &PlatformFinish) -> Result<bool>;

    /// Move an in-progress session to a terminal status. Returns false when
    /// the session had already left `in_progress`.
    async fn finish_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn touch_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn job_logs(
        &self,
        session_id: &str,
        filter: &JobLogFilter,
        page: Page,
    ) -> Result<Paged<SessionJobLog>>;

    async fn job_log_summary(&self, session_id: &str) -> Result<JobLogSummary>;
}

/// Result of inserting a posting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostingInsert {
    Inserted,
    /// Another writer already holds this (platform, external_job_id)
    Conflict { existing_id: String },
}

/// Lookup and persistence of imported job postings. Lookups take normalized
/// keys.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PostingStore: Send + Sync {
    async fn find_by_platform_id(
        &self,
        platform: Platform,
        external_job_id: &str,
    ) -> Result<Option<JobPosting>>;

    async fn find_by_title_company_location(
        &self,
        title: &str,
        company: &str,
        location: &str,
    ) -> Result<Option<JobPosting>>;

    async fn find_by_title_company(&self, title: &str, company: &str) -> Result<Vec<JobPosting>>;

    async fn insert_posting(&self, posting: &JobPosting) -> Result<PostingInsert>;
}

/// The four stores a running orchestrator needs
#[derive(Clone)]
pub struct Storage {
    pub credentials: Arc<dyn CredentialStore>,
    pub queue: Arc<dyn QueueStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub postings: Arc<dyn PostingStore>,
}

impl Storage {
    pub fn memory() -> Self {
        let backend = Arc::new(MemoryStorage::new());
        Self {
            credentials: backend.clone(),
            queue: backend.clone(),
            sessions: backend.clone(),
            postings: backend,
        }
    }
}

/// Factory for creating the configured storage backend
pub struct StorageFactory;

impl StorageFactory {
    pub async fn create(settings: &StorageSettings) -> Result<Storage> {
        match settings.backend {
            StorageBackend::Memory => {
                info!("Using in-memory storage; state is lost on exit");
                Ok(Storage::memory())
            }
            StorageBackend::Postgresql => {
                let backend = Arc::new(PostgresStorage::new(settings).await?);
                Ok(Storage {
                    credentials: backend.clone(),
                    queue: backend.clone(),
                    sessions: backend.clone(),
                    postings: backend,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_bounds() {
        let page = Page::new(Some(0), Some(10_000));
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, Page::MAX_PAGE_SIZE);

        let page = Page::new(Some(3), Some(2));
        assert_eq!(page.offset(), 4);
        let paged = page.apply((0..7).collect::<Vec<_>>());
        assert_eq!(paged.items, vec![4, 5]);
        assert_eq!(paged.total, 7);
    }
}
