use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::error::OrchestratorError;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Error body returned by every route
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Missing or invalid bearer token",
        )
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }
}

impl OrchestratorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidTransition { .. }
            | Self::CredentialLocked { .. }
            | Self::SessionTerminatedByOperator { .. } => StatusCode::CONFLICT,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::CredentialExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::PlatformAuthFailure { .. } => StatusCode::BAD_GATEWAY,
            Self::PlatformTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::DedupClassification(_) | Self::Config(_) | Self::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = err.status_code();
        // Internal details stay in the log
        let message = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!("Request failed: {}", err);
            "Internal error".to_string()
        } else {
            err.to_string()
        };
        Self::new(status, err.code(), message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (OrchestratorError::not_found("session", "s1"), StatusCode::NOT_FOUND),
            (
                OrchestratorError::invalid_transition("queue entry", "completed", "approved"),
                StatusCode::CONFLICT,
            ),
            (
                OrchestratorError::CredentialLocked { id: "c1".into() },
                StatusCode::CONFLICT,
            ),
            (
                OrchestratorError::Validation("empty role".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                OrchestratorError::CredentialExhausted {
                    platform: Platform::Linkedin,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code(), status, "{}", err);
        }
    }

    #[test]
    fn test_storage_errors_hide_details() {
        let err = ApiError::from(OrchestratorError::Storage("password=hunter2".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, "storage_error");
        assert!(!err.message.contains("hunter2"));
    }
}
