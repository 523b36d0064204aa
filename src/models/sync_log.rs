//! Append-only record of sync outcomes, kept for observability.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use utoipa::ToSchema;

#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct SyncLogEntry {
    pub id: i64,
    pub event_type: String,
    pub source_node: String,
    pub target_node: String,
    pub username: String,
    pub item_name: Option<String>,
    /// Human summary of the applied effect, e.g. `position=00:23:11`.
    pub synced_value: Option<String>,
    pub success: bool,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Filters for the sync-log query surface.
#[derive(Debug, Clone, Default)]
pub struct SyncLogFilter {
    pub source_node: Option<String>,
    pub target_node: Option<String>,
    pub event_type: Option<String>,
    /// Case-insensitive substring match on the item name.
    pub item_name: Option<String>,
    /// Only entries from the last N minutes.
    pub since_minutes: Option<i64>,
}
