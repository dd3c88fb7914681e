use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cli::config::QueueSettings;
use crate::error::{OrchestratorError, Result};
use crate::queue::model::{Priority, QueueFilter, QueueStatus, RoleLocationQueueEntry};
use crate::storage::{Page, Paged, QueueStore};
use crate::utils::Clock;

/// Backlog counts shown on the dashboard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub approved: u64,
    pub processing: u64,
}

/// Prioritized backlog of (role, location) scrape requests.
pub struct RoleLocationQueue {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
    settings: QueueSettings,
}

impl RoleLocationQueue {
    pub fn new(store: Arc<dyn QueueStore>, clock: Arc<dyn Clock>, settings: QueueSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    /// Add a (role, location) pair. A pair that already has an active entry
    /// gets its candidate count bumped instead of a second entry.
    pub async fn enqueue(&self, global_role_id: &str, location: &str) -> Result<RoleLocationQueueEntry> {
        let role = global_role_id.trim();
        let location = location.trim();
        if role.is_empty() {
            return Err(OrchestratorError::Validation(
                "global_role_id must not be empty".to_string(),
            ));
        }
        if location.is_empty() {
            return Err(OrchestratorError::Validation(
                "location must not be empty".to_string(),
            ));
        }

        for _ in 0..=self.settings.max_cas_retries {
            if let Some(existing) = self.store.find_active_entry(role, location).await? {
                let now = self.clock.now();
                let mut next = existing.clone();
                next.candidate_count += 1;
                stamp(&mut next, existing.version, now);
                if self.store.compare_and_swap_entry(existing.version, &next).await? {
                    debug!(
                        "Queue entry {} already active, candidate count now {}",
                        next.id, next.candidate_count
                    );
                    return Ok(next);
                }
                continue;
            }

            let status = if self.settings.auto_approve {
                QueueStatus::Approved
            } else {
                QueueStatus::Pending
            };
            let entry = RoleLocationQueueEntry::new(
                Uuid::new_v4().to_string(),
                role.to_string(),
                location.to_string(),
                status,
                self.clock.now(),
            );
            if !self.store.insert_entry(&entry).await? {
                debug!("Pair {} in {} enqueued concurrently, retrying", role, location);
                continue;
            }
            info!(
                "Enqueued {} in {} as {} ({})",
                entry.global_role_id, entry.location, entry.id, entry.queue_status
            );
            return Ok(entry);
        }

        Err(conflict(role))
    }

    pub async fn get(&self, id: &str) -> Result<RoleLocationQueueEntry> {
        self.store
            .get_entry(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("queue entry", id))
    }

    pub async fn list(&self, filter: &QueueFilter, page: Page) -> Result<Paged<RoleLocationQueueEntry>> {
        self.store.list_entries(filter, page).await
    }

    pub async fn approve(&self, id: &str) -> Result<RoleLocationQueueEntry> {
        let entry = self.move_to(id, QueueStatus::Approved).await?;
        info!("Queue entry {} approved", id);
        Ok(entry)
    }

    pub async fn reject(&self, id: &str) -> Result<RoleLocationQueueEntry> {
        let entry = self.move_to(id, QueueStatus::Rejected).await?;
        info!("Queue entry {} rejected", id);
        Ok(entry)
    }

    /// Approve the given pending entries, or every pending entry when `ids`
    /// is absent. Entries that cannot move to approved are skipped.
    pub async fn bulk_approve(&self, ids: Option<&[String]>) -> Result<Vec<RoleLocationQueueEntry>> {
        let targets: Vec<String> = match ids {
            Some(ids) => ids.to_vec(),
            None => {
                let filter = QueueFilter {
                    status: Some(QueueStatus::Pending),
                    search: None,
                };
                let mut ids = Vec::new();
                let mut page = Page::new(Some(1), Some(Page::MAX_PAGE_SIZE));
                loop {
                    let batch = self.store.list_entries(&filter, page).await?;
                    let fetched = batch.items.len();
                    ids.extend(batch.items.into_iter().map(|e| e.id));
                    if fetched < page.page_size as usize {
                        break;
                    }
                    page.page += 1;
                }
                ids
            }
        };

        let mut approved = Vec::new();
        for id in targets {
            match self.move_to(&id, QueueStatus::Approved).await {
                Ok(entry) => approved.push(entry),
                Err(OrchestratorError::InvalidTransition { from, .. }) => {
                    debug!("Skipping queue entry {} in bulk approve: {}", id, from);
                }
                Err(e) => return Err(e),
            }
        }

        info!("Bulk approved {} queue entries", approved.len());
        Ok(approved)
    }

    /// Change the scheduling tier; legal in any state.
    pub async fn update_priority(&self, id: &str, priority: Priority) -> Result<RoleLocationQueueEntry> {
        let entry = self
            .transition(id, |current, _now| {
                let mut next = current.clone();
                next.priority = priority;
                Ok(next)
            })
            .await?;
        info!("Queue entry {} priority set to {}", id, priority);
        Ok(entry)
    }

    /// Remove an entry that is not currently being scraped
    pub async fn delete(&self, id: &str) -> Result<()> {
        for _ in 0..=self.settings.max_cas_retries {
            let current = self.get(id).await?;
            if current.queue_status == QueueStatus::Processing {
                return Err(OrchestratorError::invalid_transition(
                    "queue entry",
                    current.queue_status,
                    "deleted",
                ));
            }
            if self.store.delete_entry(id, current.version).await? {
                info!("Queue entry {} deleted", id);
                return Ok(());
            }
        }
        Err(conflict(id))
    }

    /// Claim the next approved entry: best priority tier, then oldest.
    /// Returns `None` when nothing is approved.
    pub async fn dequeue_next(&self) -> Result<Option<RoleLocationQueueEntry>> {
        for attempt in 0..=self.settings.max_cas_retries {
            let candidates = self.store.approved_entries().await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            let now = self.clock.now();
            for candidate in candidates {
                let mut next = candidate.clone();
                next.queue_status = QueueStatus::Processing;
                stamp(&mut next, candidate.version, now);

                if self
                    .store
                    .compare_and_swap_entry(candidate.version, &next)
                    .await?
                {
                    info!(
                        "Dequeued {} in {} ({} priority)",
                        next.global_role_id, next.location, next.priority
                    );
                    return Ok(Some(next));
                }
                debug!(
                    "Queue entry {} claimed elsewhere (attempt {})",
                    candidate.id, attempt
                );
            }
        }

        Err(conflict("dequeue"))
    }

    /// Hand a processing entry back to the approved backlog
    pub async fn return_to_queue(&self, id: &str) -> Result<RoleLocationQueueEntry> {
        let entry = self
            .transition(id, |current, _now| {
                if current.queue_status != QueueStatus::Processing {
                    return Err(OrchestratorError::invalid_transition(
                        "queue entry",
                        current.queue_status,
                        QueueStatus::Approved,
                    ));
                }
                let mut next = current.clone();
                next.queue_status = QueueStatus::Approved;
                Ok(next)
            })
            .await?;
        info!("Queue entry {} returned to the queue", id);
        Ok(entry)
    }

    pub async fn mark_completed(&self, id: &str, jobs_scraped: u64) -> Result<RoleLocationQueueEntry> {
        let entry = self
            .transition(id, |current, now| {
                check(current, QueueStatus::Completed)?;
                let mut next = current.clone();
                next.queue_status = QueueStatus::Completed;
                next.last_scraped_at = Some(now);
                next.total_jobs_scraped += jobs_scraped;
                Ok(next)
            })
            .await?;
        info!(
            "Queue entry {} completed with {} new jobs ({} total)",
            id, jobs_scraped, entry.total_jobs_scraped
        );
        Ok(entry)
    }

    pub async fn depth(&self) -> Result<QueueDepth> {
        let counts = self.store.count_by_status().await?;
        let count = |status| counts.get(&status).copied().unwrap_or(0);
        Ok(QueueDepth {
            pending: count(QueueStatus::Pending),
            approved: count(QueueStatus::Approved),
            processing: count(QueueStatus::Processing),
        })
    }

    async fn move_to(&self, id: &str, status: QueueStatus) -> Result<RoleLocationQueueEntry> {
        self.transition(id, |current, _now| {
            check(current, status)?;
            let mut next = current.clone();
            next.queue_status = status;
            Ok(next)
        })
        .await
    }

    async fn transition<F>(&self, id: &str, mut apply: F) -> Result<RoleLocationQueueEntry>
    where
        F: FnMut(&RoleLocationQueueEntry, DateTime<Utc>) -> Result<RoleLocationQueueEntry>,
    {
        for _ in 0..=self.settings.max_cas_retries {
            let current = self.get(id).await?;
            let now = self.clock.now();
            let mut next = apply(&current, now)?;
            stamp(&mut next, current.version, now);

            if self.store.compare_and_swap_entry(current.version, &next).await? {
                return Ok(next);
            }
            debug!("Version conflict on queue entry {}, retrying", id);
        }
        Err(conflict(id))
    }
}

fn check(current: &RoleLocationQueueEntry, next: QueueStatus) -> Result<()> {
    if current.queue_status.can_transition_to(next) {
        Ok(())
    } else {
        Err(OrchestratorError::invalid_transition(
            "queue entry",
            current.queue_status,
            next,
        ))
    }
}

fn stamp(next: &mut RoleLocationQueueEntry, current_version: u64, now: DateTime<Utc>) {
    next.version = current_version + 1;
    next.updated_at = now;
}

fn conflict(id: &str) -> OrchestratorError {
    OrchestratorError::Storage(format!("queue entry {} kept changing, giving up", id))
}
