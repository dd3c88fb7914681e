use thiserror::Error;

use crate::platform::Platform;

/// Errors produced by the orchestration core.
///
/// `CredentialExhausted` and `CredentialLocked` are expected under load and
/// are returned to the caller to decide on; they never abort a session.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("No available credential for platform {platform}")]
    CredentialExhausted { platform: Platform },

    #[error("Credential {id} was modified concurrently")]
    CredentialLocked { id: String },

    #[error("Platform {platform} rejected credential {credential_id}: {message}")]
    PlatformAuthFailure {
        platform: Platform,
        credential_id: String,
        message: String,
    },

    #[error("No progress from session {session_id} within {seconds}s")]
    PlatformTimeout { session_id: String, seconds: u64 },

    #[error("Failed to classify job record: {0}")]
    DedupClassification(String),

    #[error("Session {session_id} was terminated by an operator")]
    SessionTerminatedByOperator { session_id: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Whether the same call may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CredentialExhausted { .. } | Self::CredentialLocked { .. } | Self::Storage(_)
        )
    }

    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CredentialExhausted { .. } => "credential_exhausted",
            Self::CredentialLocked { .. } => "credential_locked",
            Self::PlatformAuthFailure { .. } => "platform_auth_failure",
            Self::PlatformTimeout { .. } => "platform_timeout",
            Self::DedupClassification(_) => "dedup_classification_error",
            Self::SessionTerminatedByOperator { .. } => "session_terminated",
            Self::NotFound { .. } => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Validation(_) => "validation_error",
            Self::Config(_) => "config_error",
            Self::Storage(_) => "storage_error",
        }
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("serialization failed: {}", err))
    }
}
