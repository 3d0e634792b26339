use crate::api::routes::AppState;
use crate::observability::MetricsRecorder;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

/// GET /health/live - Liveness probe
#[tracing::instrument(skip(state))]
pub async fn liveness(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health_checker.liveness().await)
}

/// GET /health/ready - Store reachable within the probe timeout and the
/// store circuit closed
#[tracing::instrument(skip(state))]
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.health_checker.readiness().await;
    let code = if status.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

/// GET /metrics - Prometheus metrics, 404 when disabled
pub async fn metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    if !state.config.observability.metrics_enabled {
        return Err(StatusCode::NOT_FOUND);
    }
    MetricsRecorder::export().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
