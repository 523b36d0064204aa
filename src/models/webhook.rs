//! Inbound webhook payload from a media node.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Notification kinds the ingestor understands. Anything else is
/// acknowledged and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    PlaybackProgress,
    PlaybackStop,
    UserDataSaved,
    UserCreated,
    UserDeleted,
    PlaylistChange,
}

impl NotificationType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PlaybackProgress" => Some(Self::PlaybackProgress),
            "PlaybackStop" => Some(Self::PlaybackStop),
            "UserDataSaved" => Some(Self::UserDataSaved),
            "UserCreated" => Some(Self::UserCreated),
            "UserDeleted" => Some(Self::UserDeleted),
            "PlaylistChange" => Some(Self::PlaylistChange),
            _ => None,
        }
    }
}

/// Raw webhook body. Field names follow the node's notification schema;
/// everything is optional with defaults because node versions differ in
/// which fields they send.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "NotificationType", default)]
    pub notification_type: String,

    #[serde(rename = "NotificationUsername", default)]
    pub username: String,

    #[serde(rename = "UserId", default)]
    pub user_id: String,

    #[serde(rename = "ItemId", default)]
    pub item_id: String,

    #[serde(rename = "Name", default)]
    pub item_name: String,

    #[serde(rename = "ItemType", default)]
    pub item_type: String,

    /// File path on shared storage; the primary cross-node item identity.
    #[serde(rename = "Path", default)]
    pub item_path: Option<String>,

    /// 1 tick = 100 ns.
    #[serde(rename = "PlaybackPositionTicks", default)]
    pub playback_position_ticks: Option<i64>,

    #[serde(rename = "PlayedToCompletion", default)]
    pub played_to_completion: bool,

    #[serde(rename = "IsFavorite", default)]
    pub is_favorite: bool,

    #[serde(rename = "Played", default)]
    pub is_played: bool,

    /// Present on some node versions only; absent ratings are read back
    /// from the target during apply.
    #[serde(rename = "Rating", default)]
    pub rating: Option<f64>,

    /// "Import" marks bulk restore operations that must not fan out.
    #[serde(rename = "SaveReason", default)]
    pub save_reason: Option<String>,

    #[serde(rename = "Provider_imdb", default)]
    pub provider_imdb: Option<String>,

    #[serde(rename = "Provider_tmdb", default)]
    pub provider_tmdb: Option<String>,

    #[serde(rename = "Provider_tvdb", default)]
    pub provider_tvdb: Option<String>,

    #[serde(rename = "UtcTimestamp", default)]
    pub utc_timestamp: Option<DateTime<Utc>>,
}

impl WebhookPayload {
    pub fn kind(&self) -> Option<NotificationType> {
        NotificationType::parse(&self.notification_type)
    }

    /// Source timestamp: the node's own stamp when present, else receive time.
    pub fn source_timestamp(&self, received_at: DateTime<Utc>) -> DateTime<Utc> {
        self.utc_timestamp.unwrap_or(received_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_progress_payload() {
        let raw = serde_json::json!({
            "NotificationType": "PlaybackProgress",
            "NotificationUsername": "alice",
            "UserId": "U-wan-1",
            "ItemId": "I-wan-9",
            "Name": "x.mkv",
            "ItemType": "Movie",
            "Path": "/mnt/nfs/movies/x.mkv",
            "PlaybackPositionTicks": 6_000_000_000i64,
            "PlayedToCompletion": false,
            "IsFavorite": false,
            "Played": false,
            "Provider_imdb": "tt0133093",
        });
        let payload: WebhookPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.kind(), Some(NotificationType::PlaybackProgress));
        assert_eq!(payload.username, "alice");
        assert_eq!(payload.playback_position_ticks, Some(6_000_000_000));
        assert_eq!(payload.item_path.as_deref(), Some("/mnt/nfs/movies/x.mkv"));
        assert_eq!(payload.provider_imdb.as_deref(), Some("tt0133093"));
    }

    #[test]
    fn test_parse_minimal_payload() {
        let payload: WebhookPayload = serde_json::from_value(serde_json::json!({
            "NotificationType": "UserCreated",
            "NotificationUsername": "bob",
        }))
        .unwrap();
        assert_eq!(payload.kind(), Some(NotificationType::UserCreated));
        assert!(payload.item_path.is_none());
        assert!(!payload.played_to_completion);
    }

    #[test]
    fn test_unknown_notification_type() {
        let payload: WebhookPayload = serde_json::from_value(serde_json::json!({
            "NotificationType": "SessionStarted",
        }))
        .unwrap();
        assert!(payload.kind().is_none());
    }

    #[test]
    fn test_source_timestamp_prefers_node_stamp() {
        let stamp = "2026-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let payload: WebhookPayload = serde_json::from_value(serde_json::json!({
            "NotificationType": "PlaybackProgress",
            "UtcTimestamp": "2026-05-01T12:00:00Z",
        }))
        .unwrap();
        let received = "2026-05-01T12:00:05Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(payload.source_timestamp(received), stamp);
    }

    #[test]
    fn test_source_timestamp_falls_back_to_receive_time() {
        let payload = WebhookPayload::default();
        let received = Utc::now();
        assert_eq!(payload.source_timestamp(received), received);
    }
}
