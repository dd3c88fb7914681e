use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

use crate::credentials::{CredentialFilter, ScraperCredential};
use crate::dedup::JobPosting;
use crate::error::{OrchestratorError, Result};
use crate::platform::Platform;
use crate::queue::{QueueFilter, QueueStatus, RoleLocationQueueEntry};
use crate::session::{
    BatchApplication, BatchApply, BatchKey, BatchProgress, JobLogFilter, JobLogSummary,
    PlatformFinish, PlatformStatus, ScrapeSession, SessionFilter, SessionJobLog,
    SessionPlatformStatus, SessionStatus,
};
use crate::storage::{
    CredentialStore, Page, Paged, PostingInsert, PostingStore, QueueStore, SessionStore,
};

#[derive(Default)]
struct SessionTables {
    sessions: HashMap<String, ScrapeSession>,
    platforms: HashMap<String, Vec<SessionPlatformStatus>>,
    logs: HashMap<String, Vec<SessionJobLog>>,
    applied: HashSet<BatchKey>,
    parked: BTreeMap<BatchKey, BatchProgress>,
}

#[derive(Default)]
struct PostingTables {
    postings: HashMap<String, JobPosting>,
    by_platform_id: HashMap<(Platform, String), String>,
}

/// Process-local storage. Each table group sits behind its own lock, and
/// every multi-row write happens under a single write guard.
#[derive(Default)]
pub struct MemoryStorage {
    credentials: RwLock<HashMap<String, ScraperCredential>>,
    queue: RwLock<HashMap<String, RoleLocationQueueEntry>>,
    sessions: RwLock<SessionTables>,
    postings: RwLock<PostingTables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_version(current: u64, next: u64) -> Result<()> {
    if next != current + 1 {
        return Err(OrchestratorError::Storage(format!(
            "next version {} does not follow {}",
            next, current
        )));
    }
    Ok(())
}

#[async_trait]
impl CredentialStore for MemoryStorage {
    async fn insert_credential(&self, credential: &ScraperCredential) -> Result<()> {
        let mut credentials = self.credentials.write().await;
        if credentials.contains_key(&credential.id) {
            return Err(OrchestratorError::Validation(format!(
                "credential {} already exists",
                credential.id
            )));
        }
        credentials.insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    async fn get_credential(&self, id: &str) -> Result<Option<ScraperCredential>> {
        Ok(self.credentials.read().await.get(id).cloned())
    }

    async fn list_credentials(&self, filter: &CredentialFilter) -> Result<Vec<ScraperCredential>> {
        let credentials = self.credentials.read().await;
        let mut matching: Vec<_> = credentials
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        matching.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(matching)
    }

    async fn compare_and_swap_credential(
        &self,
        current_version: u64,
        next: &ScraperCredential,
    ) -> Result<bool> {
        check_version(current_version, next.version)?;
        let mut credentials = self.credentials.write().await;
        match credentials.get_mut(&next.id) {
            Some(stored) if stored.version == current_version => {
                *stored = next.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_credential(&self, id: &str, current_version: u64) -> Result<bool> {
        let mut credentials = self.credentials.write().await;
        match credentials.get(id) {
            Some(stored) if stored.version == current_version => {
                credentials.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn sorted_by_dequeue_key(mut entries: Vec<RoleLocationQueueEntry>) -> Vec<RoleLocationQueueEntry> {
    entries.sort_by(|a, b| a.dequeue_key().cmp(&b.dequeue_key()));
    entries
}

#[async_trait]
impl QueueStore for MemoryStorage {
    async fn insert_entry(&self, entry: &RoleLocationQueueEntry) -> Result<bool> {
        let mut queue = self.queue.write().await;
        let duplicate = queue.values().any(|e| {
            e.queue_status.is_active()
                && e.global_role_id == entry.global_role_id
                && e.location == entry.location
        });
        if duplicate || queue.contains_key(&entry.id) {
            return Ok(false);
        }
        queue.insert(entry.id.clone(), entry.clone());
        Ok(true)
    }

    async fn get_entry(&self, id: &str) -> Result<Option<RoleLocationQueueEntry>> {
        Ok(self.queue.read().await.get(id).cloned())
    }

    async fn list_entries(
        &self,
        filter: &QueueFilter,
        page: Page,
    ) -> Result<Paged<RoleLocationQueueEntry>> {
        let queue = self.queue.read().await;
        let matching = queue.values().filter(|e| filter.matches(e)).cloned().collect();
        Ok(page.apply(sorted_by_dequeue_key(matching)))
    }

    async fn approved_entries(&self) -> Result<Vec<RoleLocationQueueEntry>> {
        let queue = self.queue.read().await;
        let approved = queue
            .values()
            .filter(|e| e.queue_status == QueueStatus::Approved)
            .cloned()
            .collect();
        Ok(sorted_by_dequeue_key(approved))
    }

    async fn find_active_entry(
        &self,
        global_role_id: &str,
        location: &str,
    ) -> Result<Option<RoleLocationQueueEntry>> {
        let queue = self.queue.read().await;
        Ok(queue
            .values()
            .find(|e| {
                e.queue_status.is_active()
                    && e.global_role_id == global_role_id
                    && e.location == location
            })
            .cloned())
    }

    async fn compare_and_swap_entry(
        &self,
        current_version: u64,
        next: &RoleLocationQueueEntry,
    ) -> Result<bool> {
        check_version(current_version, next.version)?;
        let mut queue = self.queue.write().await;
        match queue.get_mut(&next.id) {
            Some(stored) if stored.version == current_version => {
                *stored = next.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_entry(&self, id: &str, current_version: u64) -> Result<bool> {
        let mut queue = self.queue.write().await;
        match queue.get(id) {
            Some(stored) if stored.version == current_version => {
                queue.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_by_status(&self) -> Result<HashMap<QueueStatus, u64>> {
        let queue = self.queue.read().await;
        let mut counts = HashMap::new();
        for entry in queue.values() {
            *counts.entry(entry.queue_status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl SessionStore for MemoryStorage {
    async fn insert_session(
        &self,
        session: &ScrapeSession,
        platforms: &[SessionPlatformStatus],
    ) -> Result<()> {
        let mut tables = self.sessions.write().await;
        if tables.sessions.contains_key(&session.session_id) {
            return Err(OrchestratorError::Validation(format!(
                "session {} already exists",
                session.session_id
            )));
        }
        tables
            .sessions
            .insert(session.session_id.clone(), session.clone());
        tables
            .platforms
            .insert(session.session_id.clone(), platforms.to_vec());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ScrapeSession>> {
        Ok(self.sessions.read().await.sessions.get(session_id).cloned())
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<ScrapeSession>> {
        let tables = self.sessions.read().await;
        let mut sessions: Vec<_> = tables
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    async fn platform_statuses(&self, session_id: &str) -> Result<Vec<SessionPlatformStatus>> {
        let tables = self.sessions.read().await;
        let mut rows = tables.platforms.get(session_id).cloned().unwrap_or_default();
        rows.sort_by_key(|row| row.platform_name);
        Ok(rows)
    }

    async fn set_platform_credential(
        &self,
        session_id: &str,
        platform: Platform,
        credential_id: &str,
    ) -> Result<()> {
        let mut tables = self.sessions.write().await;
        let row = tables
            .platforms
            .get_mut(session_id)
            .and_then(|rows| rows.iter_mut().find(|r| r.platform_name == platform))
            .ok_or_else(|| OrchestratorError::not_found("session platform", session_id))?;
        row.credential_id = Some(credential_id.to_string());
        Ok(())
    }

    async fn apply_batch(&self, batch: &BatchApplication) -> Result<BatchApply> {
        let mut guard = self.sessions.write().await;
        let tables = &mut *guard;
        let session_id = batch.key.session_id.as_str();

        if tables.applied.contains(&batch.key) {
            return Ok(BatchApply::AlreadyApplied);
        }

        let session = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestratorError::not_found("session", session_id))?;
        if session.status.is_terminal() {
            return Err(OrchestratorError::invalid_transition(
                "session",
                session.status,
                "batch applied",
            ));
        }

        let rows = tables
            .platforms
            .get_mut(session_id)
            .ok_or_else(|| OrchestratorError::not_found("session platform", session_id))?;
        let row = rows
            .iter_mut()
            .find(|r| r.platform_name == batch.key.platform)
            .ok_or_else(|| OrchestratorError::not_found("session platform", session_id))?;
        if row.completed_batches != batch.key.batch_index {
            return Ok(if batch.key.batch_index < row.completed_batches {
                BatchApply::AlreadyApplied
            } else {
                BatchApply::OutOfOrder {
                    expected: row.completed_batches,
                }
            });
        }

        let counts = batch.counts();
        row.jobs_found += counts.found;
        row.jobs_imported += counts.imported;
        row.jobs_skipped += counts.skipped;
        row.completed_batches += 1;
        row.total_batches = row
            .total_batches
            .max(batch.total_batches_hint.unwrap_or(0))
            .max(row.completed_batches);
        if row.status == PlatformStatus::Pending {
            row.status = PlatformStatus::InProgress;
            row.started_at.get_or_insert(batch.applied_at);
        }

        session.jobs_found += counts.found;
        session.jobs_imported += counts.imported;
        session.jobs_skipped += counts.skipped;
        session.completed_batches += 1;
        session.total_batches = rows.iter().map(|r| r.total_batches).sum();
        session.last_progress_at = batch.applied_at;

        tables
            .logs
            .entry(session_id.to_string())
            .or_default()
            .extend(batch.logs.iter().cloned());
        tables.applied.insert(batch.key.clone());
        Ok(BatchApply::Applied)
    }

    async fn park_batch(
        &self,
        session_id: &str,
        platform: Platform,
        batch: &BatchProgress,
        _at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.sessions.write().await;
        if !tables.sessions.contains_key(session_id) {
            return Err(OrchestratorError::not_found("session", session_id));
        }
        let key = BatchKey {
            session_id: session_id.to_string(),
            platform,
            batch_index: batch.batch_index,
        };
        if tables.parked.contains_key(&key) {
            return Ok(false);
        }
        tables.parked.insert(key, batch.clone());
        Ok(true)
    }

    async fn take_parked_batch(
        &self,
        session_id: &str,
        platform: Platform,
        batch_index: u32,
    ) -> Result<Option<BatchProgress>> {
        let key = BatchKey {
            session_id: session_id.to_string(),
            platform,
            batch_index,
        };
        Ok(self.sessions.write().await.parked.remove(&key))
    }

    async fn discard_parked_batches(
        &self,
        session_id: &str,
        platform: Option<Platform>,
    ) -> Result<u64> {
        let mut tables = self.sessions.write().await;
        let before = tables.parked.len();
        tables.parked.retain(|key, _| {
            key.session_id != session_id || platform.map_or(false, |p| p != key.platform)
        });
        Ok((before - tables.parked.len()) as u64)
    }

    async fn finish_platform(&self, finish: &PlatformFinish) -> Result<bool> {
        let mut guard = self.sessions.write().await;
        let tables = &mut *guard;
        let session_id = finish.session_id.as_str();

        let row = tables
            .platforms
            .get_mut(session_id)
            .and_then(|rows| rows.iter_mut().find(|r| r.platform_name == finish.platform))
            .ok_or_else(|| OrchestratorError::not_found("session platform", session_id))?;
        if row.status.is_terminal() {
            return Ok(false);
        }

        row.status = finish.status;
        row.completed_at = Some(finish.at);
        if finish.error_message.is_some() {
            row.error_message = finish.error_message.clone();
        }

        let session = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestratorError::not_found("session", session_id))?;
        match finish.status {
            PlatformStatus::Completed => session.platforms_completed += 1,
            PlatformStatus::Failed => session.platforms_failed += 1,
            _ => {}
        }
        session.last_progress_at = session.last_progress_at.max(finish.at);
        Ok(true)
    }

    async fn finish_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.sessions.write().await;
        let session = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestratorError::not_found("session", session_id))?;
        if !session.status.can_transition_to(status) {
            return Ok(false);
        }
        session.status = status;
        session.completed_at = Some(at);
        if let Some(message) = error_message {
            session.error_message = Some(message.to_string());
        }
        Ok(true)
    }

    async fn touch_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.sessions.write().await;
        if let Some(session) = tables.sessions.get_mut(session_id) {
            session.last_progress_at = session.last_progress_at.max(at);
        }
        Ok(())
    }

    async fn job_logs(
        &self,
        session_id: &str,
        filter: &JobLogFilter,
        page: Page,
    ) -> Result<Paged<SessionJobLog>> {
        let tables = self.sessions.read().await;
        let matching: Vec<SessionJobLog> = tables
            .logs
            .get(session_id)
            .map(|logs| logs.iter().filter(|l| filter.matches(l)).cloned().collect())
            .unwrap_or_default();
        Ok(page.apply(matching))
    }

    async fn job_log_summary(&self, session_id: &str) -> Result<JobLogSummary> {
        let tables = self.sessions.read().await;
        let mut summary = JobLogSummary::default();
        for log in tables.logs.get(session_id).into_iter().flatten() {
            summary.record(log.status, log.skip_reason);
        }
        Ok(summary)
    }
}

#[async_trait]
impl PostingStore for MemoryStorage {
    async fn find_by_platform_id(
        &self,
        platform: Platform,
        external_job_id: &str,
    ) -> Result<Option<JobPosting>> {
        let tables = self.postings.read().await;
        Ok(tables
            .by_platform_id
            .get(&(platform, external_job_id.to_string()))
            .and_then(|id| tables.postings.get(id))
            .cloned())
    }

    async fn find_by_title_company_location(
        &self,
        title: &str,
        company: &str,
        location: &str,
    ) -> Result<Option<JobPosting>> {
        let tables = self.postings.read().await;
        Ok(tables
            .postings
            .values()
            .filter(|p| {
                p.normalized_title == title
                    && p.normalized_company == company
                    && p.normalized_location == location
            })
            .min_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
            .cloned())
    }

    async fn find_by_title_company(&self, title: &str, company: &str) -> Result<Vec<JobPosting>> {
        let tables = self.postings.read().await;
        let mut matching: Vec<_> = tables
            .postings
            .values()
            .filter(|p| p.normalized_title == title && p.normalized_company == company)
            .cloned()
            .collect();
        matching.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(matching)
    }

    async fn insert_posting(&self, posting: &JobPosting) -> Result<PostingInsert> {
        let mut tables = self.postings.write().await;
        if let Some(external_id) = &posting.external_job_id {
            let key = (posting.platform, external_id.clone());
            if let Some(existing_id) = tables.by_platform_id.get(&key) {
                return Ok(PostingInsert::Conflict {
                    existing_id: existing_id.clone(),
                });
            }
            tables.by_platform_id.insert(key, posting.id.clone());
        }
        tables.postings.insert(posting.id.clone(), posting.clone());
        Ok(PostingInsert::Inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialSecret;
    use crate::session::JobLogStatus;

    fn session(id: &str, now: DateTime<Utc>) -> ScrapeSession {
        ScrapeSession {
            session_id: id.to_string(),
            role_location_queue_id: "q1".into(),
            role_id: "role".into(),
            location: "Remote".into(),
            status: SessionStatus::InProgress,
            platforms_total: 1,
            platforms_completed: 0,
            platforms_failed: 0,
            jobs_found: 0,
            jobs_imported: 0,
            jobs_skipped: 0,
            total_batches: 0,
            completed_batches: 0,
            started_at: now,
            completed_at: None,
            last_progress_at: now,
            error_message: None,
        }
    }

    fn batch(index: u32, hint: Option<u32>, statuses: &[JobLogStatus]) -> BatchApplication {
        let now = Utc::now();
        BatchApplication {
            key: BatchKey {
                session_id: "s1".into(),
                platform: Platform::Linkedin,
                batch_index: index,
            },
            total_batches_hint: hint,
            logs: statuses
                .iter()
                .enumerate()
                .map(|(i, status)| SessionJobLog {
                    session_id: "s1".into(),
                    platform_name: Platform::Linkedin,
                    batch_index: index,
                    job_index: i as u64,
                    status: *status,
                    skip_reason: None,
                    duplicate_job_id: None,
                    imported_job_id: None,
                    external_job_id: None,
                    title: None,
                    company: None,
                    error_message: None,
                    created_at: now,
                })
                .collect(),
            applied_at: now,
        }
    }

    #[tokio::test]
    async fn test_credential_cas_rejects_stale_version() {
        let store = MemoryStorage::new();
        let credential = ScraperCredential::new(
            "c1".into(),
            Platform::Linkedin,
            "bot".into(),
            CredentialSecret::Json {
                payload: serde_json::json!({"cookie": "x"}),
            },
            Utc::now(),
        );
        store.insert_credential(&credential).await.unwrap();

        let mut next = credential.clone();
        next.version = 1;
        assert!(store.compare_and_swap_credential(0, &next).await.unwrap());
        assert!(!store.compare_and_swap_credential(0, &next).await.unwrap());

        // A version that skips ahead is a caller bug.
        next.version = 5;
        assert!(store.compare_and_swap_credential(1, &next).await.is_err());

        assert!(!store.delete_credential("c1", 0).await.unwrap());
        assert!(store.delete_credential("c1", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_batch_is_idempotent() {
        let store = MemoryStorage::new();
        let now = Utc::now();
        store
            .insert_session(
                &session("s1", now),
                &[SessionPlatformStatus::pending("s1", Platform::Linkedin)],
            )
            .await
            .unwrap();

        let first = batch(0, Some(3), &[JobLogStatus::Imported, JobLogStatus::Skipped]);
        assert_eq!(store.apply_batch(&first).await.unwrap(), BatchApply::Applied);
        assert_eq!(
            store.apply_batch(&first).await.unwrap(),
            BatchApply::AlreadyApplied
        );

        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.jobs_found, 2);
        assert_eq!(session.jobs_imported, 1);
        assert_eq!(session.completed_batches, 1);
        assert_eq!(session.total_batches, 3);

        let rows = store.platform_statuses("s1").await.unwrap();
        assert_eq!(rows[0].status, PlatformStatus::InProgress);
        assert_eq!(rows[0].completed_batches, 1);

        // A lower hint never shrinks the total below what was applied.
        assert_eq!(
            store.apply_batch(&batch(1, Some(1), &[])).await.unwrap(),
            BatchApply::Applied
        );
        let rows = store.platform_statuses("s1").await.unwrap();
        assert_eq!(rows[0].total_batches, 3);
        assert!(rows[0].completed_batches <= rows[0].total_batches);

        let summary = store.job_log_summary("s1").await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.imported, 1);
    }

    #[tokio::test]
    async fn test_apply_batch_requires_next_index() {
        let store = MemoryStorage::new();
        store
            .insert_session(
                &session("s1", Utc::now()),
                &[SessionPlatformStatus::pending("s1", Platform::Linkedin)],
            )
            .await
            .unwrap();

        let early = batch(2, None, &[JobLogStatus::Imported]);
        assert_eq!(
            store.apply_batch(&early).await.unwrap(),
            BatchApply::OutOfOrder { expected: 0 }
        );
        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.jobs_found, 0);
        assert_eq!(session.completed_batches, 0);
        assert_eq!(store.job_log_summary("s1").await.unwrap().total, 0);

        // The early batch was not recorded as applied.
        store.apply_batch(&batch(0, None, &[])).await.unwrap();
        store.apply_batch(&batch(1, None, &[])).await.unwrap();
        assert_eq!(store.apply_batch(&early).await.unwrap(), BatchApply::Applied);
    }

    #[tokio::test]
    async fn test_parked_batches_are_taken_once() {
        let store = MemoryStorage::new();
        let now = Utc::now();
        store
            .insert_session(
                &session("s1", now),
                &[
                    SessionPlatformStatus::pending("s1", Platform::Linkedin),
                    SessionPlatformStatus::pending("s1", Platform::Glassdoor),
                ],
            )
            .await
            .unwrap();

        let held = BatchProgress {
            batch_index: 3,
            ..Default::default()
        };
        assert!(store.park_batch("s1", Platform::Linkedin, &held, now).await.unwrap());
        assert!(!store.park_batch("s1", Platform::Linkedin, &held, now).await.unwrap());
        assert!(store.park_batch("s1", Platform::Glassdoor, &held, now).await.unwrap());
        assert!(store.park_batch("nope", Platform::Linkedin, &held, now).await.is_err());

        assert!(store
            .take_parked_batch("s1", Platform::Linkedin, 2)
            .await
            .unwrap()
            .is_none());
        let taken = store
            .take_parked_batch("s1", Platform::Linkedin, 3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(taken.batch_index, 3);
        assert!(store
            .take_parked_batch("s1", Platform::Linkedin, 3)
            .await
            .unwrap()
            .is_none());

        store.park_batch("s1", Platform::Linkedin, &held, now).await.unwrap();
        assert_eq!(
            store
                .discard_parked_batches("s1", Some(Platform::Glassdoor))
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.discard_parked_batches("s1", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_finish_platform_and_session_once() {
        let store = MemoryStorage::new();
        let now = Utc::now();
        store
            .insert_session(
                &session("s1", now),
                &[SessionPlatformStatus::pending("s1", Platform::Linkedin)],
            )
            .await
            .unwrap();

        let finish = PlatformFinish {
            session_id: "s1".into(),
            platform: Platform::Linkedin,
            status: PlatformStatus::Failed,
            error_message: Some("blocked".into()),
            at: now,
        };
        assert!(store.finish_platform(&finish).await.unwrap());
        assert!(!store.finish_platform(&finish).await.unwrap());
        assert_eq!(
            store.get_session("s1").await.unwrap().unwrap().platforms_failed,
            1
        );

        assert!(store
            .finish_session("s1", SessionStatus::Failed, Some("all platforms failed"), now)
            .await
            .unwrap());
        assert!(!store
            .finish_session("s1", SessionStatus::Completed, None, now)
            .await
            .unwrap());

        // Terminal sessions accept no more batches.
        assert!(store.apply_batch(&batch(0, None, &[])).await.is_err());
    }

    #[tokio::test]
    async fn test_queue_insert_rejects_active_twin() {
        let store = MemoryStorage::new();
        let now = Utc::now();
        let first = RoleLocationQueueEntry::new(
            "q1".into(),
            "role".into(),
            "Remote".into(),
            QueueStatus::Pending,
            now,
        );
        let twin = RoleLocationQueueEntry::new(
            "q2".into(),
            "role".into(),
            "Remote".into(),
            QueueStatus::Pending,
            now,
        );
        assert!(store.insert_entry(&first).await.unwrap());
        assert!(!store.insert_entry(&twin).await.unwrap());
    }
}
