use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::dedup::{JobRecord, SkipReason};
use crate::platform::Platform;
use crate::storage::Paged;
use crate::utils::enums::text_enum;

/// Session lifecycle; every state but `in_progress` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Failed,
    Terminated,
}

text_enum!(SessionStatus {
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Terminated => "terminated",
});

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        self != SessionStatus::InProgress
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        self == SessionStatus::InProgress && next.is_terminal()
    }
}

/// Progress of one platform inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

text_enum!(PlatformStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
});

impl PlatformStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlatformStatus::Completed | PlatformStatus::Failed | PlatformStatus::Skipped
        )
    }
}

/// Per-record log state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobLogStatus {
    Pending,
    Imported,
    Skipped,
    Error,
}

text_enum!(JobLogStatus {
    Pending => "pending",
    Imported => "imported",
    Skipped => "skipped",
    Error => "error",
});

/// One end-to-end scrape run for a single queue entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeSession {
    pub session_id: String,
    pub role_location_queue_id: String,
    pub role_id: String,
    pub location: String,
    pub status: SessionStatus,

    pub platforms_total: u32,
    pub platforms_completed: u32,
    pub platforms_failed: u32,

    pub jobs_found: u64,
    pub jobs_imported: u64,
    pub jobs_skipped: u64,

    pub total_batches: u32,
    pub completed_batches: u32,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Last batch, completion or creation event; drives the timeout sweep
    pub last_progress_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Progress of one platform within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPlatformStatus {
    pub session_id: String,
    pub platform_name: Platform,
    pub status: PlatformStatus,

    /// Credential leased for this platform, if acquisition succeeded
    pub credential_id: Option<String>,

    pub jobs_found: u64,
    pub jobs_imported: u64,
    pub jobs_skipped: u64,

    pub total_batches: u32,
    pub completed_batches: u32,

    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionPlatformStatus {
    pub fn pending(session_id: &str, platform: Platform) -> Self {
        Self {
            session_id: session_id.to_string(),
            platform_name: platform,
            status: PlatformStatus::Pending,
            credential_id: None,
            jobs_found: 0,
            jobs_imported: 0,
            jobs_skipped: 0,
            total_batches: 0,
            completed_batches: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// One row per scraped job candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionJobLog {
    pub session_id: String,
    pub platform_name: Platform,
    pub batch_index: u32,

    /// Position of the record in the platform's stream
    pub job_index: u64,

    pub status: JobLogStatus,
    pub skip_reason: Option<SkipReason>,
    pub duplicate_job_id: Option<String>,
    pub imported_job_id: Option<String>,

    pub external_job_id: Option<String>,
    pub title: Option<String>,
    pub company: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Idempotency key of a batch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchKey {
    pub session_id: String,
    pub platform: Platform,
    pub batch_index: u32,
}

/// Counter deltas of a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub found: u64,
    pub imported: u64,
    pub skipped: u64,
}

/// Everything a store writes atomically for one batch
#[derive(Debug, Clone)]
pub struct BatchApplication {
    pub key: BatchKey,
    pub total_batches_hint: Option<u32>,
    pub logs: Vec<SessionJobLog>,
    pub applied_at: DateTime<Utc>,
}

impl BatchApplication {
    /// Errored records count as skipped: they were not imported.
    pub fn counts(&self) -> BatchCounts {
        let mut counts = BatchCounts {
            found: self.logs.len() as u64,
            ..Default::default()
        };
        for log in &self.logs {
            match log.status {
                JobLogStatus::Imported => counts.imported += 1,
                JobLogStatus::Skipped | JobLogStatus::Error => counts.skipped += 1,
                JobLogStatus::Pending => {}
            }
        }
        counts
    }
}

/// What a store did with a batch application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchApply {
    Applied,
    /// The key was applied before; nothing written
    AlreadyApplied,
    /// The platform has not reached this index; nothing written
    OutOfOrder { expected: u32 },
}

/// Terminal update of one platform
#[derive(Debug, Clone)]
pub struct PlatformFinish {
    pub session_id: String,
    pub platform: Platform,
    pub status: PlatformStatus,
    pub error_message: Option<String>,
    pub at: DateTime<Utc>,
}

/// A batch as delivered by a platform worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Zero-based position of the batch within the platform
    pub batch_index: u32,
    /// Worker's current estimate of the platform's batch count
    #[serde(default)]
    pub total_batches: Option<u32>,
    #[serde(default)]
    pub records: Vec<JobRecord>,
}

/// What `record_batch_progress` did with a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// The batch (and `applied_batches - 1` held successors) were applied
    Applied { applied_batches: u32 },
    /// The key was already applied; nothing changed
    Duplicate,
    /// Arrived ahead of a missing predecessor and is held in storage until
    /// the gap closes
    Buffered { waiting_for: u32 },
}

/// Terminal outcome reported by a platform worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformOutcome {
    Completed,
    Failed,
}

/// Filter for listing sessions, newest first
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub started_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl SessionFilter {
    pub fn matches(&self, session: &ScrapeSession) -> bool {
        self.status.map_or(true, |s| session.status == s)
            && self.started_after.map_or(true, |t| session.started_at >= t)
    }
}

/// Filter for a session's job logs
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobLogFilter {
    pub status: Option<JobLogStatus>,
    pub platform: Option<Platform>,
    pub skip_reason: Option<SkipReason>,
}

impl JobLogFilter {
    pub fn matches(&self, log: &SessionJobLog) -> bool {
        self.status.map_or(true, |s| log.status == s)
            && self.platform.map_or(true, |p| log.platform_name == p)
            && self.skip_reason.map_or(true, |r| log.skip_reason == Some(r))
    }
}

/// Outcome histogram of a session's job logs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobLogSummary {
    pub total: u64,
    pub imported: u64,
    pub skipped: u64,
    pub errors: u64,
    /// Always carries all five reasons, zero-filled
    pub skip_reasons: BTreeMap<SkipReason, u64>,
}

impl Default for JobLogSummary {
    fn default() -> Self {
        Self {
            total: 0,
            imported: 0,
            skipped: 0,
            errors: 0,
            skip_reasons: SkipReason::ALL.iter().map(|r| (*r, 0)).collect(),
        }
    }
}

impl JobLogSummary {
    pub fn record(&mut self, status: JobLogStatus, reason: Option<SkipReason>) {
        self.add(status, reason, 1);
    }

    /// Fold in `count` logs sharing a status and reason
    pub fn add(&mut self, status: JobLogStatus, reason: Option<SkipReason>, count: u64) {
        self.total += count;
        match status {
            JobLogStatus::Imported => self.imported += count,
            JobLogStatus::Skipped => self.skipped += count,
            JobLogStatus::Error => self.errors += count,
            JobLogStatus::Pending => {}
        }
        if let Some(reason) = reason {
            *self.skip_reasons.entry(reason).or_default() += count;
        }
    }
}

/// Response of `terminate_session`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminationReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub role_id: String,
    pub role_returned_to_queue: bool,
    pub message: String,
}

/// Session together with its platform rows
#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: ScrapeSession,
    pub platform_statuses: Vec<SessionPlatformStatus>,
}

/// One page of a session's job logs plus the whole-session histogram
#[derive(Debug, Clone, Serialize)]
pub struct SessionJobs {
    pub session_id: String,
    #[serde(flatten)]
    pub jobs: Paged<SessionJobLog>,
    pub summary: JobLogSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_machine() {
        assert!(SessionStatus::InProgress.can_transition_to(SessionStatus::Terminated));
        assert!(!SessionStatus::Completed.can_transition_to(SessionStatus::Failed));
        assert!(!SessionStatus::InProgress.can_transition_to(SessionStatus::InProgress));
    }

    #[test]
    fn test_summary_is_zero_filled() {
        let summary = JobLogSummary::default();
        let json = serde_json::to_value(&summary).unwrap();
        let reasons = json["skip_reasons"].as_object().unwrap();
        assert_eq!(reasons.len(), 5);
        assert_eq!(reasons["duplicate_title_company_description"], 0);
    }

    #[test]
    fn test_batch_counts_treat_errors_as_skipped() {
        let log = |status| SessionJobLog {
            session_id: "s1".into(),
            platform_name: Platform::Linkedin,
            batch_index: 0,
            job_index: 0,
            status,
            skip_reason: None,
            duplicate_job_id: None,
            imported_job_id: None,
            external_job_id: None,
            title: None,
            company: None,
            error_message: None,
            created_at: Utc::now(),
        };
        let batch = BatchApplication {
            key: BatchKey {
                session_id: "s1".into(),
                platform: Platform::Linkedin,
                batch_index: 0,
            },
            total_batches_hint: None,
            logs: vec![
                log(JobLogStatus::Imported),
                log(JobLogStatus::Skipped),
                log(JobLogStatus::Error),
            ],
            applied_at: Utc::now(),
        };
        assert_eq!(
            batch.counts(),
            BatchCounts {
                found: 3,
                imported: 1,
                skipped: 2
            }
        );
    }
}
