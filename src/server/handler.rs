use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::debug;

use crate::auth::bearer_token;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub redis: &'static str,
    pub cache_enabled: bool,
    pub rate_limit_enabled: bool,
}

/// Liveness plus store state. Probing here lets a monitor's poll trigger
/// reconnection.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let redis_healthy = state.manager.health_check().await;

    Json(HealthResponse {
        status: "healthy",
        redis: if redis_healthy { "healthy" } else { "degraded" },
        cache_enabled: state.cache.is_enabled(),
        rate_limit_enabled: state.policy.load().rate_limit_enabled(),
    })
}

pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::gather(),
    )
}

/// Today's usage of a metered feature for the calling user
pub async fn quota_status(
    State(state): State<AppState>,
    Path(feature): Path<String>,
    headers: HeaderMap,
) -> Response {
    let claims = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .and_then(|token| state.verifier.verify(token));

    let Some(claims) = claims else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "detail": "Not authenticated" })),
        )
            .into_response();
    };

    debug!("Quota status for user {} on {}", claims.user_id, feature);

    match state
        .quotas
        .status(&feature, &claims.user_id, claims.tier.as_deref())
        .await
    {
        Ok(status) => Json(status).into_response(),
        Err(rejection) => rejection.into_response(),
    }
}
