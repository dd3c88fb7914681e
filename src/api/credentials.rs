use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiResult;
use crate::app::AppContext;
use crate::credentials::{
    CredentialFilter, CredentialSecret, CredentialStatus, PlatformHealth, ScraperCredential,
};
use crate::platform::Platform;

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route(
            "/scraper-credentials",
            get(list_credentials).post(create_credential),
        )
        .route(
            "/scraper-credentials/",
            get(list_credentials).post(create_credential),
        )
        .route("/scraper-credentials/health", get(credential_health))
        .route(
            "/scraper-credentials/{id}",
            axum::routing::delete(delete_credential),
        )
        .route("/scraper-credentials/{id}/enable", post(enable_credential))
        .route("/scraper-credentials/{id}/disable", post(disable_credential))
        .route("/scraper-credentials/{id}/reset", post(reset_credential))
}

/// Dashboard view of a credential; the secret never leaves the server
#[derive(Debug, Serialize)]
pub struct CredentialView {
    pub id: String,
    pub platform: Platform,
    pub name: String,
    pub kind: &'static str,
    pub identity: Option<String>,
    pub status: CredentialStatus,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_failure_message: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub assigned_to_session_id: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ScraperCredential> for CredentialView {
    fn from(credential: ScraperCredential) -> Self {
        Self {
            kind: credential.secret.kind(),
            identity: credential.secret.display_identity(),
            id: credential.id,
            platform: credential.platform,
            name: credential.name,
            status: credential.status,
            failure_count: credential.failure_count,
            success_count: credential.success_count,
            last_failure_at: credential.last_failure_at,
            last_failure_message: credential.last_failure_message,
            last_success_at: credential.last_success_at,
            assigned_to_session_id: credential.assigned_to_session_id,
            assigned_at: credential.assigned_at,
            cooldown_until: credential.cooldown_until,
            last_used_at: credential.last_used_at,
            created_at: credential.created_at,
            updated_at: credential.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CredentialQuery {
    platform: Option<Platform>,
    status: Option<CredentialStatus>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCredentialRequest {
    platform: Platform,
    #[serde(default)]
    name: String,
    secret: CredentialSecret,
}

async fn list_credentials(
    State(ctx): State<AppContext>,
    Query(query): Query<CredentialQuery>,
) -> ApiResult<Json<Vec<CredentialView>>> {
    let filter = CredentialFilter {
        platform: query.platform,
        status: query.status,
        ..Default::default()
    };
    let credentials = ctx.pool.list(&filter).await?;
    Ok(Json(credentials.into_iter().map(CredentialView::from).collect()))
}

async fn create_credential(
    State(ctx): State<AppContext>,
    Json(request): Json<CreateCredentialRequest>,
) -> ApiResult<(StatusCode, Json<CredentialView>)> {
    let credential = ctx
        .pool
        .create(request.platform, &request.name, request.secret)
        .await?;
    Ok((StatusCode::CREATED, Json(credential.into())))
}

async fn credential_health(State(ctx): State<AppContext>) -> ApiResult<Json<Vec<PlatformHealth>>> {
    Ok(Json(ctx.pool.health().await?))
}

async fn enable_credential(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<CredentialView>> {
    Ok(Json(ctx.pool.enable(&id).await?.into()))
}

async fn disable_credential(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<CredentialView>> {
    Ok(Json(ctx.pool.disable(&id).await?.into()))
}

async fn reset_credential(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<CredentialView>> {
    Ok(Json(ctx.pool.reset(&id).await?.into()))
}

async fn delete_credential(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    ctx.pool.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
