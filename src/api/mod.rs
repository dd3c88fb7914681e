pub mod credentials;
pub mod error;
pub mod monitoring;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::{self, Next},
    response::Response,
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::AppContext;

pub use error::{ApiError, ApiResult};

/// Every REST route, behind the bearer-token check
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .merge(credentials::routes())
        .merge(monitoring::routes())
        .layer(middleware::from_fn_with_state(ctx.clone(), require_token))
        .with_state(ctx)
}

/// Rejects requests without the configured token. Open when none is set.
async fn require_token(
    State(ctx): State<AppContext>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = ctx.config.api.auth_token.as_deref() {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        if presented != Some(expected) {
            warn!("Rejected unauthenticated {} {}", request.method(), request.uri().path());
            return Err(ApiError::unauthorized());
        }
    }
    Ok(next.run(request).await)
}

/// Serve the API until `shutdown` fires
pub async fn serve(ctx: AppContext, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(&ctx.config.api.bind_address).await?;
    info!("API listening on {}", listener.local_addr()?);

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
