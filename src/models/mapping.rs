//! Identity cache rows: user mappings and item lookups.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::FromRow;
use utoipa::ToSchema;

/// Item-cache entries older than this are refreshed on next use.
pub const ITEM_CACHE_TTL_HOURS: i64 = 24;

/// Maps a username (stored lowercased) to its remote id on one node.
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct UserMapping {
    pub id: i64,
    pub username: String,
    pub node_name: String,
    pub remote_user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Maps a lookup key (`path:…` or `imdb:…`/`tmdb:…`/`tvdb:…`) to the
/// remote item id on one node.
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct ItemCacheEntry {
    pub id: i64,
    pub node_name: String,
    pub lookup_key: String,
    pub remote_item_id: String,
    pub item_name: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl ItemCacheEntry {
    /// The item may have been moved or replaced since the lookup; stale
    /// entries are re-verified against the node.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.fetched_at > Duration::hours(ITEM_CACHE_TTL_HOURS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fetched_at: DateTime<Utc>) -> ItemCacheEntry {
        ItemCacheEntry {
            id: 1,
            node_name: "lan".into(),
            lookup_key: "path:/mnt/x.mkv".into(),
            remote_item_id: "I-lan-17".into(),
            item_name: Some("x.mkv".into()),
            fetched_at,
        }
    }

    #[test]
    fn test_fresh_entry_is_not_stale() {
        let now = Utc::now();
        assert!(!entry(now - Duration::hours(1)).is_stale(now));
    }

    #[test]
    fn test_entry_past_ttl_is_stale() {
        let now = Utc::now();
        assert!(entry(now - Duration::hours(25)).is_stale(now));
    }

    #[test]
    fn test_entry_at_ttl_boundary_is_fresh() {
        let now = Utc::now();
        assert!(!entry(now - Duration::hours(24)).is_stale(now));
    }
}
