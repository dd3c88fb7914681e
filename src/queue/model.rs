use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::enums::text_enum;

/// Approval and processing state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Approved,
    Processing,
    Completed,
    Rejected,
}

text_enum!(QueueStatus {
    Pending => "pending",
    Approved => "approved",
    Processing => "processing",
    Completed => "completed",
    Rejected => "rejected",
});

impl QueueStatus {
    /// Operator and dequeue transitions. Leaving `processing` for `approved`
    /// is reserved to the orchestrator handing work back.
    pub fn can_transition_to(self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Processing)
                | (Approved, Rejected)
                | (Processing, Completed)
                | (Completed, Approved)
                | (Rejected, Approved)
        )
    }

    /// Entries in these states still represent outstanding work.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            QueueStatus::Pending | QueueStatus::Approved | QueueStatus::Processing
        )
    }
}

/// Operator-controlled scheduling tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

text_enum!(Priority {
    Urgent => "urgent",
    High => "high",
    Normal => "normal",
    Low => "low",
});

impl Priority {
    /// Lower rank is dequeued first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

/// A pending unit of scrape work identified by (global role, location)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleLocationQueueEntry {
    pub id: String,
    pub global_role_id: String,
    pub location: String,
    pub queue_status: QueueStatus,
    pub priority: Priority,

    /// Number of candidates that asked for this role/location
    pub candidate_count: u32,

    /// Jobs imported across every completed scrape of this entry
    pub total_jobs_scraped: u64,
    pub last_scraped_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Optimistic-lock version, bumped on every write
    pub version: u64,
}

impl RoleLocationQueueEntry {
    pub fn new(
        id: String,
        global_role_id: String,
        location: String,
        status: QueueStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            global_role_id,
            location,
            queue_status: status,
            priority: Priority::Normal,
            candidate_count: 1,
            total_jobs_scraped: 0,
            last_scraped_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Dequeue order: priority tier, then oldest first.
    pub fn dequeue_key(&self) -> (u8, DateTime<Utc>, &str) {
        (self.priority.rank(), self.created_at, self.id.as_str())
    }
}

/// Filter for listing queue entries
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueFilter {
    pub status: Option<QueueStatus>,
    /// Case-insensitive substring of the role id or location
    pub search: Option<String>,
}

impl QueueFilter {
    pub fn matches(&self, entry: &RoleLocationQueueEntry) -> bool {
        if let Some(status) = self.status {
            if entry.queue_status != status {
                return false;
            }
        }
        match self.search.as_deref().map(str::trim) {
            Some(term) if !term.is_empty() => {
                let term = term.to_lowercase();
                entry.global_role_id.to_lowercase().contains(&term)
                    || entry.location.to_lowercase().contains(&term)
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_rank_order() {
        let mut tiers = vec![Priority::Low, Priority::Urgent, Priority::Normal, Priority::High];
        tiers.sort_by_key(|p| p.rank());
        assert_eq!(
            tiers,
            vec![Priority::Urgent, Priority::High, Priority::Normal, Priority::Low]
        );
    }

    #[test]
    fn test_queue_transitions() {
        use QueueStatus::*;
        assert!(Approved.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Approved));
        assert!(!Pending.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Rejected));
    }

    #[test]
    fn test_filter_search() {
        let entry = RoleLocationQueueEntry::new(
            "q1".into(),
            "role-data-engineer".into(),
            "Austin, TX".into(),
            QueueStatus::Pending,
            Utc::now(),
        );
        let filter = QueueFilter {
            status: None,
            search: Some("austin".into()),
        };
        assert!(filter.matches(&entry));

        let filter = QueueFilter {
            status: Some(QueueStatus::Approved),
            search: None,
        };
        assert!(!filter.matches(&entry));
    }
}
