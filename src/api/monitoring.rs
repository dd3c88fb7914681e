use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::app::AppContext;
use crate::credentials::CredentialOutcome;
use crate::dedup::SkipReason;
use crate::platform::Platform;
use crate::queue::{Priority, QueueFilter, QueueStatus, RoleLocationQueueEntry};
use crate::session::{
    BatchOutcome, BatchProgress, DashboardStats, JobLogFilter, JobLogStatus, PlatformOutcome,
    ScrapeSession, SessionDetail, SessionFilter, SessionJobs, SessionStatus, TerminationReport,
};
use crate::storage::{Page, Paged};

const QUEUE: &str = "/scraper-monitoring/role-location-queue";
const SESSIONS: &str = "/scraper-monitoring/sessions";

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route(QUEUE, get(list_queue).post(enqueue))
        .route(&format!("{QUEUE}/bulk-approve"), post(bulk_approve))
        .route(&format!("{QUEUE}/{{id}}"), axum::routing::delete(delete_entry))
        .route(&format!("{QUEUE}/{{id}}/approve"), post(approve_entry))
        .route(&format!("{QUEUE}/{{id}}/reject"), post(reject_entry))
        .route(&format!("{QUEUE}/{{id}}/priority"), patch(update_priority))
        .route(SESSIONS, get(list_sessions))
        .route(&format!("{SESSIONS}/{{id}}"), get(get_session))
        .route(&format!("{SESSIONS}/{{id}}/terminate"), post(terminate_session))
        .route(&format!("{SESSIONS}/{{id}}/jobs"), get(session_jobs))
        .route(
            &format!("{SESSIONS}/{{id}}/platforms/{{platform}}/batches"),
            post(record_batch),
        )
        .route(
            &format!("{SESSIONS}/{{id}}/platforms/{{platform}}/complete"),
            post(complete_platform),
        )
        .route("/scraper-monitoring/dispatch", post(dispatch))
        .route("/scraper-monitoring/stats", get(stats))
}

#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    status: Option<QueueStatus>,
    search: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    global_role_id: String,
    location: String,
    priority: Option<Priority>,
}

#[derive(Debug, Deserialize)]
pub struct PriorityRequest {
    priority: Priority,
}

#[derive(Debug, Default, Deserialize)]
pub struct BulkApproveRequest {
    /// Approve these ids; every pending entry when absent
    ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct BulkApproveResponse {
    approved: usize,
    entries: Vec<RoleLocationQueueEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    status: Option<SessionStatus>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    status: Option<JobLogStatus>,
    platform: Option<Platform>,
    skip_reason: Option<SkipReason>,
    page: Option<u32>,
    page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    outcome: PlatformOutcome,
    /// Set when the platform rejected the login
    #[serde(default)]
    credential_failed: bool,
    message: Option<String>,
}

async fn list_queue(
    State(ctx): State<AppContext>,
    Query(query): Query<QueueQuery>,
) -> ApiResult<Json<Paged<RoleLocationQueueEntry>>> {
    let filter = QueueFilter {
        status: query.status,
        search: query.search,
    };
    let page = Page::new(query.page, query.page_size);
    Ok(Json(ctx.queue.list(&filter, page).await?))
}

async fn enqueue(
    State(ctx): State<AppContext>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<(StatusCode, Json<RoleLocationQueueEntry>)> {
    let mut entry = ctx
        .queue
        .enqueue(&request.global_role_id, &request.location)
        .await?;
    if let Some(priority) = request.priority.filter(|p| *p != entry.priority) {
        entry = ctx.queue.update_priority(&entry.id, priority).await?;
    }
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn approve_entry(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<RoleLocationQueueEntry>> {
    Ok(Json(ctx.queue.approve(&id).await?))
}

async fn reject_entry(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<RoleLocationQueueEntry>> {
    Ok(Json(ctx.queue.reject(&id).await?))
}

async fn update_priority(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(request): Json<PriorityRequest>,
) -> ApiResult<Json<RoleLocationQueueEntry>> {
    Ok(Json(ctx.queue.update_priority(&id, request.priority).await?))
}

async fn bulk_approve(
    State(ctx): State<AppContext>,
    body: Bytes,
) -> ApiResult<Json<BulkApproveResponse>> {
    let request: BulkApproveRequest = if body.iter().all(u8::is_ascii_whitespace) {
        BulkApproveRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(e.to_string()))?
    };
    let entries = ctx.queue.bulk_approve(request.ids.as_deref()).await?;
    Ok(Json(BulkApproveResponse {
        approved: entries.len(),
        entries,
    }))
}

async fn delete_entry(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    ctx.queue.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_sessions(
    State(ctx): State<AppContext>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Json<Vec<ScrapeSession>>> {
    let filter = SessionFilter {
        status: query.status,
        limit: Some(query.limit.unwrap_or(50).min(500)),
        ..Default::default()
    };
    Ok(Json(ctx.orchestrator.list_sessions(&filter).await?))
}

async fn get_session(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionDetail>> {
    Ok(Json(ctx.orchestrator.get_session(&id).await?))
}

async fn terminate_session(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<TerminationReport>> {
    Ok(Json(ctx.orchestrator.terminate_session(&id).await?))
}

async fn session_jobs(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Query(query): Query<JobsQuery>,
) -> ApiResult<Json<SessionJobs>> {
    let filter = JobLogFilter {
        status: query.status,
        platform: query.platform,
        skip_reason: query.skip_reason,
    };
    let page = Page::new(query.page, query.page_size);
    Ok(Json(ctx.orchestrator.session_jobs(&id, &filter, page).await?))
}

async fn stats(State(ctx): State<AppContext>) -> ApiResult<Json<DashboardStats>> {
    Ok(Json(ctx.orchestrator.stats().await?))
}

async fn dispatch(State(ctx): State<AppContext>) -> ApiResult<Response> {
    Ok(match ctx.orchestrator.dispatch_next().await? {
        Some(detail) => (StatusCode::CREATED, Json(detail)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn record_batch(
    State(ctx): State<AppContext>,
    Path((id, platform)): Path<(String, Platform)>,
    Json(batch): Json<BatchProgress>,
) -> ApiResult<Json<BatchOutcome>> {
    Ok(Json(
        ctx.orchestrator
            .record_batch_progress(&id, platform, batch)
            .await?,
    ))
}

async fn complete_platform(
    State(ctx): State<AppContext>,
    Path((id, platform)): Path<(String, Platform)>,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<Json<SessionDetail>> {
    let credential_outcome = if request.credential_failed {
        CredentialOutcome::Failure {
            message: request.message,
        }
    } else {
        CredentialOutcome::Success
    };
    Ok(Json(
        ctx.orchestrator
            .complete_platform(&id, platform, request.outcome, credential_outcome)
            .await?,
    ))
}
