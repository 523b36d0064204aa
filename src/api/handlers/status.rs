//! Read-only store projections for the dashboard.

use std::collections::BTreeMap;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, OpenApi, ToSchema};

use crate::api::SharedState;
use crate::error::Result;
use crate::models::{EventStatus, PendingEvent, SyncLogEntry, SyncLogFilter};

/// Create status routes.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/queue", get(get_queue))
        .route("/events/pending", get(get_pending_events))
        .route("/events/waiting", get(get_waiting_events))
        .route("/sync-log", get(get_sync_log))
        .route("/users", get(get_users))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct NodeStatus {
    pub name: String,
    pub url: String,
    pub passwordless: bool,
    pub healthy: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QueueStatus {
    pub pending_events: i64,
    pub processing_events: i64,
    pub waiting_for_item_events: i64,
    pub failed_events: i64,
    pub worker_running: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DatabaseStatus {
    pub connected: bool,
    pub user_mappings_count: i64,
    pub item_cache_count: i64,
    pub pending_events_count: i64,
    pub sync_log_entries: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SyncStatsView {
    pub total_synced: i64,
    pub successful: i64,
    pub failed: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OverallStatus {
    /// `healthy`, `degraded` or `unhealthy`.
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub servers: Vec<NodeStatus>,
    pub queue: QueueStatus,
    pub database: DatabaseStatus,
    pub sync_stats: SyncStatsView,
}

/// Queue row projection.
#[derive(Debug, Serialize, ToSchema)]
pub struct PendingEventView {
    pub id: i64,
    pub event_type: String,
    pub source_node: String,
    pub target_node: String,
    pub username: String,
    pub item_name: Option<String>,
    pub state: String,
    pub attempts: i64,
    pub item_not_found_count: i64,
    pub item_not_found_max: i64,
    pub last_error: Option<String>,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<PendingEvent> for PendingEventView {
    fn from(event: PendingEvent) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type.as_str().to_string(),
            source_node: event.source_node,
            target_node: event.target_node,
            username: event.username,
            item_name: event.item_name,
            state: event.state.as_str().to_string(),
            attempts: event.attempts,
            item_not_found_count: event.item_not_found_count,
            item_not_found_max: event.item_not_found_max,
            last_error: event.last_error,
            next_retry_at: event.next_retry_at,
            created_at: event.created_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SyncLogQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub since_minutes: Option<i64>,
    pub source_node: Option<String>,
    pub target_node: Option<String>,
    pub event_type: Option<String>,
    pub item_name: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SyncLogPage {
    pub entries: Vec<SyncLogEntry>,
    pub total: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserMatrix {
    pub servers: Vec<String>,
    pub users: Vec<UserMatrixRow>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserMatrixRow {
    pub username: String,
    /// Remote user id per node name; null where the user is unmapped.
    pub servers: BTreeMap<String, Option<String>>,
}

async fn queue_status(state: &SharedState) -> Result<QueueStatus> {
    let counts = state.store.queue_counts().await?;
    let stats = state.store.sync_stats().await?;
    Ok(QueueStatus {
        pending_events: counts.pending,
        processing_events: counts.processing,
        waiting_for_item_events: counts.waiting_item,
        failed_events: stats.failed,
        worker_running: state.worker_running(),
    })
}

/// Comprehensive system status for the dashboard.
#[utoipa::path(
    get,
    path = "/status",
    context_path = "/api",
    tag = "status",
    responses((status = 200, description = "System status", body = OverallStatus))
)]
pub async fn get_status(State(state): State<SharedState>) -> Result<Json<OverallStatus>> {
    let health = state.probe_nodes().await;
    let servers: Vec<NodeStatus> = state
        .config
        .servers
        .iter()
        .map(|node| NodeStatus {
            name: node.name.clone(),
            url: node.url.clone(),
            passwordless: node.passwordless,
            healthy: health.get(&node.name).copied().unwrap_or(false),
        })
        .collect();

    let queue = queue_status(&state).await?;
    let connected = state.store.ping().await.is_ok();
    let database = DatabaseStatus {
        connected,
        user_mappings_count: state.store.user_mapping_count().await?,
        item_cache_count: state.store.item_cache_count().await?,
        pending_events_count: queue.pending_events,
        sync_log_entries: state.store.sync_log_count().await?,
    };
    let stats = state.store.sync_stats().await?;

    let all_healthy = servers.iter().all(|s| s.healthy);
    let any_healthy = servers.iter().any(|s| s.healthy);
    let status = if all_healthy && queue.worker_running && connected {
        "healthy"
    } else if any_healthy && queue.worker_running && connected {
        "degraded"
    } else {
        "unhealthy"
    };

    Ok(Json(OverallStatus {
        status: status.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        servers,
        queue,
        database,
        sync_stats: SyncStatsView {
            total_synced: stats.total,
            successful: stats.successful,
            failed: stats.failed,
            last_sync_at: stats.last_sync_at,
        },
    }))
}

/// Queue counters.
#[utoipa::path(
    get,
    path = "/queue",
    context_path = "/api",
    tag = "status",
    responses((status = 200, description = "Queue status", body = QueueStatus))
)]
pub async fn get_queue(State(state): State<SharedState>) -> Result<Json<QueueStatus>> {
    Ok(Json(queue_status(&state).await?))
}

/// Events awaiting their first or next apply attempt.
#[utoipa::path(
    get,
    path = "/events/pending",
    context_path = "/api",
    tag = "status",
    params(ListQuery),
    responses((status = 200, description = "Pending events", body = [PendingEventView]))
)]
pub async fn get_pending_events(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<PendingEventView>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let events = state.store.list_events(EventStatus::Pending, limit).await?;
    Ok(Json(events.into_iter().map(Into::into).collect()))
}

/// Events parked until their item appears on the target.
#[utoipa::path(
    get,
    path = "/events/waiting",
    context_path = "/api",
    tag = "status",
    params(ListQuery),
    responses((status = 200, description = "Waiting events", body = [PendingEventView]))
)]
pub async fn get_waiting_events(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<PendingEventView>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let events = state
        .store
        .list_events(EventStatus::WaitingItem, limit)
        .await?;
    Ok(Json(events.into_iter().map(Into::into).collect()))
}

/// Filtered page of sync outcomes, newest first.
#[utoipa::path(
    get,
    path = "/sync-log",
    context_path = "/api",
    tag = "status",
    params(SyncLogQuery),
    responses((status = 200, description = "Sync log page", body = SyncLogPage))
)]
pub async fn get_sync_log(
    State(state): State<SharedState>,
    Query(query): Query<SyncLogQuery>,
) -> Result<Json<SyncLogPage>> {
    let filter = SyncLogFilter {
        source_node: query.source_node,
        target_node: query.target_node,
        event_type: query.event_type,
        item_name: query.item_name,
        since_minutes: query.since_minutes,
    };
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0).max(0);
    let (entries, total) = state.store.query_sync_log(&filter, limit, offset).await?;
    Ok(Json(SyncLogPage { entries, total }))
}

/// User mappings grouped by username with per-node presence.
#[utoipa::path(
    get,
    path = "/users",
    context_path = "/api",
    tag = "status",
    responses((status = 200, description = "User mapping matrix", body = UserMatrix))
)]
pub async fn get_users(State(state): State<SharedState>) -> Result<Json<UserMatrix>> {
    let server_names: Vec<String> = state
        .config
        .servers
        .iter()
        .map(|s| s.name.clone())
        .collect();

    let mut users: BTreeMap<String, BTreeMap<String, Option<String>>> = BTreeMap::new();
    for mapping in state.store.all_user_mappings().await? {
        let row = users.entry(mapping.username.clone()).or_insert_with(|| {
            server_names
                .iter()
                .map(|name| (name.clone(), None))
                .collect()
        });
        row.insert(mapping.node_name, Some(mapping.remote_user_id));
    }

    Ok(Json(UserMatrix {
        servers: server_names,
        users: users
            .into_iter()
            .map(|(username, servers)| UserMatrixRow { username, servers })
            .collect(),
    }))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_status,
        get_queue,
        get_pending_events,
        get_waiting_events,
        get_sync_log,
        get_users
    ),
    components(schemas(
        OverallStatus,
        NodeStatus,
        QueueStatus,
        DatabaseStatus,
        SyncStatsView,
        PendingEventView,
        SyncLogPage,
        SyncLogEntry,
        UserMatrix,
        UserMatrixRow
    ))
)]
pub struct StatusApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_status_serialization() {
        let status = QueueStatus {
            pending_events: 3,
            processing_events: 1,
            waiting_for_item_events: 2,
            failed_events: 0,
            worker_running: true,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"pending_events\":3"));
        assert!(json.contains("\"worker_running\":true"));
    }

    #[test]
    fn test_overall_status_serialization() {
        let status = OverallStatus {
            status: "degraded".into(),
            uptime_seconds: 42,
            version: "0.3.1".into(),
            servers: vec![NodeStatus {
                name: "wan".into(),
                url: "http://wan:8096".into(),
                passwordless: false,
                healthy: true,
            }],
            queue: QueueStatus {
                pending_events: 0,
                processing_events: 0,
                waiting_for_item_events: 0,
                failed_events: 0,
                worker_running: true,
            },
            database: DatabaseStatus {
                connected: true,
                user_mappings_count: 2,
                item_cache_count: 5,
                pending_events_count: 0,
                sync_log_entries: 7,
            },
            sync_stats: SyncStatsView {
                total_synced: 7,
                successful: 6,
                failed: 1,
                last_sync_at: None,
            },
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"degraded\""));
        assert!(json.contains("\"servers\""));
        assert!(json.contains("\"sync_stats\""));
    }

    #[test]
    fn test_user_matrix_row_serialization() {
        let mut servers = BTreeMap::new();
        servers.insert("wan".to_string(), Some("U-wan-1".to_string()));
        servers.insert("lan".to_string(), None);
        let row = UserMatrixRow {
            username: "alice".into(),
            servers,
        };
        let json = serde_json::to_string(&row).unwrap();
        assert!(json.contains("\"lan\":null"));
        assert!(json.contains("\"wan\":\"U-wan-1\""));
    }
}
