//! Webhook receiver.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use utoipa::OpenApi;

use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::WebhookPayload;
use crate::services::ingest::{CreatedUserAck, IngestAck};

/// Create webhook routes.
pub fn router() -> Router<SharedState> {
    Router::new().route("/:node_name", post(receive_webhook))
}

/// Receive a notification from a media node.
///
/// Each node is configured to POST its webhooks to
/// `/webhook/{node_name}` where `node_name` matches the configuration.
/// Intents are enqueued for asynchronous processing; the response only
/// acknowledges the enqueue (plus any generated user credentials).
#[utoipa::path(
    post,
    path = "/{node_name}",
    context_path = "/webhook",
    tag = "webhook",
    params(("node_name" = String, Path, description = "Configured origin node name")),
    responses(
        (status = 202, description = "Events enqueued", body = IngestAck),
        (status = 400, description = "Malformed payload"),
        (status = 404, description = "Unknown node name"),
    )
)]
pub async fn receive_webhook(
    State(state): State<SharedState>,
    Path(node_name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse> {
    let payload: WebhookPayload = serde_json::from_value(body)
        .map_err(|e| AppError::MalformedPayload(e.to_string()))?;

    let ack = state.ingestor.ingest(&node_name, &payload, Utc::now()).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

#[derive(OpenApi)]
#[openapi(
    paths(receive_webhook),
    components(schemas(IngestAck, CreatedUserAck))
)]
pub struct WebhookApiDoc;
