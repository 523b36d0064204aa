//! OpenAPI document assembly.

use utoipa::OpenApi;

use super::handlers::{health, status, webhook};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "crosswatch",
        description = "Bidirectional watch-state replication for media-library server fleets"
    ),
    tags(
        (name = "webhook", description = "Inbound node notifications"),
        (name = "status", description = "Store projections for the dashboard"),
        (name = "health", description = "Liveness and readiness probes"),
    )
)]
struct RootDoc;

/// Merge all handler docs into one spec.
pub fn build_openapi() -> utoipa::openapi::OpenApi {
    let mut doc = RootDoc::openapi();
    doc.merge(webhook::WebhookApiDoc::openapi());
    doc.merge(status::StatusApiDoc::openapi());
    doc.merge(health::HealthApiDoc::openapi());
    doc
}
