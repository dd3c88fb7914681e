use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::platform::Platform;
use crate::utils::enums::text_enum;

/// Lifecycle state of a scraper credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Available,
    InUse,
    Failed,
    Disabled,
    Cooldown,
}

text_enum!(CredentialStatus {
    Available => "available",
    InUse => "in_use",
    Failed => "failed",
    Disabled => "disabled",
    Cooldown => "cooldown",
});

impl CredentialStatus {
    /// Transitions the pool may perform on its own. Operator actions
    /// (enable, disable, reset) bypass this table.
    pub fn can_transition_to(self, next: CredentialStatus) -> bool {
        use CredentialStatus::*;
        matches!(
            (self, next),
            (Available, InUse)
                | (InUse, Available)
                | (InUse, Cooldown)
                | (InUse, Disabled)
                | (InUse, Failed)
                | (Cooldown, Available)
        )
    }
}

/// Login material for one platform account.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialSecret {
    Email { email: String, password: String },
    Json { payload: serde_json::Value },
}

impl CredentialSecret {
    pub fn kind(&self) -> &'static str {
        match self {
            CredentialSecret::Email { .. } => "email",
            CredentialSecret::Json { .. } => "json",
        }
    }

    /// Account label safe to show on a dashboard.
    pub fn display_identity(&self) -> Option<String> {
        match self {
            CredentialSecret::Email { email, .. } => Some(email.clone()),
            CredentialSecret::Json { .. } => None,
        }
    }
}

impl fmt::Debug for CredentialSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSecret::Email { email, .. } => f
                .debug_struct("Email")
                .field("email", email)
                .field("password", &"<redacted>")
                .finish(),
            CredentialSecret::Json { .. } => f
                .debug_struct("Json")
                .field("payload", &"<redacted>")
                .finish(),
        }
    }
}

/// A stored login for one external job platform
#[derive(Debug, Clone, PartialEq)]
pub struct ScraperCredential {
    /// Unique identifier
    pub id: String,

    /// Platform this login belongs to
    pub platform: Platform,

    /// Operator-facing label
    pub name: String,

    /// Login material
    pub secret: CredentialSecret,

    /// Current lifecycle state
    pub status: CredentialStatus,

    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_failure_message: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,

    /// Session holding this credential; set exactly when status is `in_use`
    pub assigned_to_session_id: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,

    /// Earliest time a cooling-down credential may be handed out again
    pub cooldown_until: Option<DateTime<Utc>>,

    /// Last time the credential was released back from a session
    pub last_used_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Optimistic-lock version, bumped on every write
    pub version: u64,
}

impl ScraperCredential {
    pub fn new(
        id: String,
        platform: Platform,
        name: String,
        secret: CredentialSecret,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            platform,
            name,
            secret,
            status: CredentialStatus::Available,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_failure_message: None,
            last_success_at: None,
            assigned_to_session_id: None,
            assigned_at: None,
            cooldown_until: None,
            last_used_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// `status == in_use` exactly when a session owns the credential.
    pub fn is_consistent(&self) -> bool {
        (self.status == CredentialStatus::InUse) == self.assigned_to_session_id.is_some()
    }

    /// Used to hand out the longest-idle credential first.
    pub fn idle_since(&self) -> DateTime<Utc> {
        self.last_used_at.unwrap_or(self.created_at)
    }

    pub(crate) fn clear_assignment(&mut self) {
        self.assigned_to_session_id = None;
        self.assigned_at = None;
    }
}

/// Filter for listing credentials
#[derive(Debug, Clone, Default)]
pub struct CredentialFilter {
    pub platform: Option<Platform>,
    pub status: Option<CredentialStatus>,
    pub assigned_to_session_id: Option<String>,
}

impl CredentialFilter {
    pub fn matches(&self, credential: &ScraperCredential) -> bool {
        self.platform.map_or(true, |p| credential.platform == p)
            && self.status.map_or(true, |s| credential.status == s)
            && self
                .assigned_to_session_id
                .as_deref()
                .map_or(true, |id| credential.assigned_to_session_id.as_deref() == Some(id))
    }
}

/// Per-platform status counts for the dashboard
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlatformHealth {
    pub platform: Option<Platform>,
    pub total: u64,
    pub available: u64,
    pub in_use: u64,
    pub cooldown: u64,
    pub disabled: u64,
    pub failed: u64,
}

impl PlatformHealth {
    pub fn record(&mut self, status: CredentialStatus) {
        self.total += 1;
        match status {
            CredentialStatus::Available => self.available += 1,
            CredentialStatus::InUse => self.in_use += 1,
            CredentialStatus::Cooldown => self.cooldown += 1,
            CredentialStatus::Disabled => self.disabled += 1,
            CredentialStatus::Failed => self.failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use CredentialStatus::*;
        assert!(Available.can_transition_to(InUse));
        assert!(InUse.can_transition_to(Cooldown));
        assert!(Cooldown.can_transition_to(Available));
        assert!(!Cooldown.can_transition_to(InUse));
        assert!(!Disabled.can_transition_to(InUse));
        assert!(!Available.can_transition_to(Cooldown));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = CredentialSecret::Email {
            email: "bot@example.com".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{:?}", secret);
        assert!(rendered.contains("bot@example.com"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_secret_wire_format() {
        let secret: CredentialSecret =
            serde_json::from_str(r#"{"kind":"json","payload":{"li_at":"abc"}}"#).unwrap();
        assert_eq!(secret.kind(), "json");
        assert_eq!(secret.display_identity(), None);
    }
}
