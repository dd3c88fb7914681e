use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::platform::Platform;
use crate::utils::enums::text_enum;

/// Raw job record as delivered by a platform worker. Every field is optional
/// because workers forward whatever the page yielded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(default)]
    pub external_job_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub job_url: Option<String>,
}

/// Canonical imported job, unique per (platform, external_job_id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: String,
    pub platform: Platform,
    pub external_job_id: Option<String>,
    pub title: String,
    pub company: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub job_url: String,

    /// Normalized keys used by the duplicate rules
    pub normalized_title: String,
    pub normalized_company: String,
    pub normalized_location: String,

    /// Session that imported it
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

/// Closed set of reasons a record was not imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    DuplicatePlatformId,
    DuplicateTitleCompanyLocation,
    DuplicateTitleCompanyDescription,
    MissingRequired,
    Error,
}

text_enum!(SkipReason {
    DuplicatePlatformId => "duplicate_platform_id",
    DuplicateTitleCompanyLocation => "duplicate_title_company_location",
    DuplicateTitleCompanyDescription => "duplicate_title_company_description",
    MissingRequired => "missing_required",
    Error => "error",
});

/// Decision of the rule chain for one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Import,
    Skip {
        reason: SkipReason,
        duplicate_job_id: Option<String>,
    },
    Error {
        message: String,
    },
}

impl Verdict {
    pub fn skip(reason: SkipReason, duplicate_job_id: Option<String>) -> Self {
        Verdict::Skip {
            reason,
            duplicate_job_id,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Verdict::Import => None,
            Verdict::Skip { reason, .. } => Some(*reason),
            Verdict::Error { .. } => Some(SkipReason::Error),
        }
    }
}

/// Final result for a record once an import has been persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub verdict: Verdict,
    pub imported_job_id: Option<String>,
}

impl RecordOutcome {
    pub fn duplicate_job_id(&self) -> Option<&str> {
        match &self.verdict {
            Verdict::Skip {
                duplicate_job_id, ..
            } => duplicate_job_id.as_deref(),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.verdict {
            Verdict::Error { message } => Some(message.as_str()),
            _ => None,
        }
    }
}
