//! Health probes.
//!
//! - `/healthz`: liveness, 200 whenever the process can serve HTTP.
//! - `/readyz`: readiness, store open, worker running, at least one
//!   node reachable.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use utoipa::OpenApi;

use crate::api::SharedState;

/// Liveness probe. If this handler runs, the process is alive; node or
/// store trouble must not restart the pod.
#[utoipa::path(
    get,
    path = "/healthz",
    context_path = "",
    tag = "health",
    responses((status = 200, description = "Process is alive"))
)]
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe.
#[utoipa::path(
    get,
    path = "/readyz",
    context_path = "",
    tag = "health",
    responses(
        (status = 200, description = "Service is ready"),
        (status = 503, description = "Service is not ready"),
    )
)]
pub async fn readyz(State(state): State<SharedState>) -> impl IntoResponse {
    if state.store.ping().await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "store unavailable");
    }
    if !state.worker_running() {
        return (StatusCode::SERVICE_UNAVAILABLE, "worker not running");
    }
    let health = state.probe_nodes().await;
    if !health.values().any(|&reachable| reachable) {
        return (StatusCode::SERVICE_UNAVAILABLE, "no nodes reachable");
    }
    (StatusCode::OK, "ok")
}

#[derive(OpenApi)]
#[openapi(paths(healthz, readyz))]
pub struct HealthApiDoc;
