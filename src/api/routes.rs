//! Route definitions for the API.

use axum::{routing::get, Router};
use utoipa_swagger_ui::SwaggerUi;

use super::handlers;
use super::SharedState;

/// Create the main API router.
pub fn create_router(state: SharedState) -> Router {
    // Build OpenAPI spec once at startup
    let openapi = super::openapi::build_openapi();

    Router::new()
        // Health endpoints (no auth, no side effects)
        .route("/healthz", get(handlers::health::healthz))
        .route("/readyz", get(handlers::health::readyz))
        // OpenAPI spec + Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", openapi))
        // Webhook receiver, one path per configured node
        .nest("/webhook", handlers::webhook::router())
        // Read-only store projections
        .nest("/api", handlers::status::router())
        .with_state(state)
}
