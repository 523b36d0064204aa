//! Event queue types: intents, pending rows, payload snapshots, outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// Kinds of replicated user-state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SyncEventType {
    Progress,
    Watched,
    Favorite,
    Rating,
    UserCreated,
    UserDeleted,
    PlaylistChange,
}

impl SyncEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Watched => "watched",
            Self::Favorite => "favorite",
            Self::Rating => "rating",
            Self::UserCreated => "user_created",
            Self::UserDeleted => "user_deleted",
            Self::PlaylistChange => "playlist_change",
        }
    }

    /// The user-data field this event writes on the target, used as the
    /// cooldown key component. Lifecycle and playlist events have none.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Progress => Some("position"),
            Self::Watched => Some("played"),
            Self::Favorite => Some("favorite"),
            Self::Rating => Some("rating"),
            Self::UserCreated | Self::UserDeleted | Self::PlaylistChange => None,
        }
    }
}

impl std::fmt::Display for SyncEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a pending event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    WaitingItem,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::WaitingItem => "waiting_item",
            Self::Failed => "failed",
        }
    }
}

/// A value captured on the source node together with its source timestamp.
/// Merges are last-write-wins per field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub value: T,
    pub at: DateTime<Utc>,
}

impl<T> Stamped<T> {
    pub fn new(value: T, at: DateTime<Utc>) -> Self {
        Self { value, at }
    }
}

/// External provider identifiers used for cross-node item matching when
/// file paths differ or are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderIds {
    pub imdb: Option<String>,
    pub tmdb: Option<String>,
    pub tvdb: Option<String>,
}

/// Provider lookup order is fixed: imdb, then tmdb, then tvdb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Imdb,
    Tmdb,
    Tvdb,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Imdb => "imdb",
            Self::Tmdb => "tmdb",
            Self::Tvdb => "tvdb",
        }
    }
}

impl ProviderIds {
    pub fn is_empty(&self) -> bool {
        self.imdb.is_none() && self.tmdb.is_none() && self.tvdb.is_none()
    }

    /// Provider/value pairs in lookup order, skipping absent ids.
    pub fn in_order(&self) -> Vec<(Provider, &str)> {
        [
            (Provider::Imdb, self.imdb.as_deref()),
            (Provider::Tmdb, self.tmdb.as_deref()),
            (Provider::Tvdb, self.tvdb.as_deref()),
        ]
        .into_iter()
        .filter_map(|(p, v)| v.map(|v| (p, v)))
        .collect()
    }
}

/// Descriptor of the media item as seen on the source node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRef {
    pub source_item_id: String,
    pub name: String,
    pub path: Option<String>,
    #[serde(default)]
    pub providers: ProviderIds,
}

impl ItemRef {
    /// Node-independent identity key: the file path when present (works for
    /// home media without provider ids), else the first provider tuple.
    pub fn identity_key(&self) -> Option<String> {
        if let Some(path) = self.path.as_deref() {
            if !path.is_empty() {
                return Some(format!("path:{path}"));
            }
        }
        self.providers
            .in_order()
            .first()
            .map(|(p, v)| format!("{}:{}", p.as_str(), v))
    }
}

/// The user the change belongs to, as known on the source node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRef {
    pub source_user_id: String,
    pub username: String,
}

/// Per-field stamped values carried by an event. Absent fields are not
/// written on the target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_ticks: Option<Stamped<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub played: Option<Stamped<bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favorite: Option<Stamped<bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<Stamped<f64>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub played_to_completion: bool,
    /// Password generated at ingest for user-creation fan-out targets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn merge_field<T>(ours: &mut Option<Stamped<T>>, theirs: Option<Stamped<T>>) {
    if let Some(incoming) = theirs {
        match ours {
            Some(current) if incoming.at < current.at => {}
            _ => *ours = Some(incoming),
        }
    }
}

/// Normalized snapshot sufficient to apply the change on any target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub user: UserRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<ItemRef>,
    #[serde(default)]
    pub fields: FieldSet,
}

impl EventPayload {
    /// Coalesce a newer snapshot into this one. Per-field timestamps win;
    /// the item/user descriptors are replaced by the incoming snapshot.
    pub fn merge_newer(&mut self, incoming: EventPayload) {
        self.user = incoming.user;
        if incoming.item.is_some() {
            self.item = incoming.item;
        }
        merge_field(&mut self.fields.position_ticks, incoming.fields.position_ticks);
        merge_field(&mut self.fields.played, incoming.fields.played);
        merge_field(&mut self.fields.favorite, incoming.fields.favorite);
        merge_field(&mut self.fields.rating, incoming.fields.rating);
        self.fields.played_to_completion |= incoming.fields.played_to_completion;
        if incoming.fields.password.is_some() {
            self.fields.password = incoming.fields.password;
        }
    }

    /// Newest source timestamp across all stamped fields.
    pub fn source_timestamp(&self) -> Option<DateTime<Utc>> {
        [
            self.fields.position_ticks.as_ref().map(|s| s.at),
            self.fields.played.as_ref().map(|s| s.at),
            self.fields.favorite.as_ref().map(|s| s.at),
            self.fields.rating.as_ref().map(|s| s.at),
        ]
        .into_iter()
        .flatten()
        .max()
    }
}

/// A normalized per-target work unit derived from one inbound webhook,
/// ready to be enqueued.
#[derive(Debug, Clone)]
pub struct EventIntent {
    pub dedup_key: String,
    pub event_type: SyncEventType,
    pub source_node: String,
    pub target_node: String,
    pub username: String,
    pub item_key: Option<String>,
    pub item_name: Option<String>,
    pub payload: EventPayload,
}

/// A row leased from the pending-event queue.
#[derive(Debug, Clone, FromRow)]
pub struct PendingEvent {
    pub id: i64,
    pub dedup_key: String,
    pub event_type: SyncEventType,
    pub source_node: String,
    pub target_node: String,
    pub username: String,
    pub item_key: Option<String>,
    pub item_name: Option<String>,
    pub payload: Json<EventPayload>,
    pub state: EventStatus,
    pub attempts: i64,
    pub item_not_found_count: i64,
    pub item_not_found_max: i64,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What happened to a leased event; drives the store's finalize transition.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// Change applied on the target; row is removed and logged.
    Applied { synced_value: Option<String> },
    /// Nothing to do (cooldown, already set, target newer); removed and logged.
    Skipped { reason: String },
    /// Transient failure; row returns to pending after `delay_seconds`.
    Retry { delay_seconds: i64, reason: String },
    /// Item absent on target; row parks in waiting_item per path policy.
    WaitItem {
        delay_seconds: i64,
        max: i64,
        reason: String,
    },
    /// Permanent failure; row is removed and logged as unsuccessful.
    Failed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn payload_with_position(ticks: i64, at: DateTime<Utc>) -> EventPayload {
        EventPayload {
            user: UserRef {
                source_user_id: "u1".into(),
                username: "alice".into(),
            },
            item: Some(ItemRef {
                source_item_id: "i1".into(),
                name: "x.mkv".into(),
                path: Some("/mnt/nfs/movies/x.mkv".into()),
                providers: ProviderIds::default(),
            }),
            fields: FieldSet {
                position_ticks: Some(Stamped::new(ticks, at)),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_identity_key_prefers_path() {
        let item = ItemRef {
            source_item_id: "i1".into(),
            name: "x".into(),
            path: Some("/mnt/x.mkv".into()),
            providers: ProviderIds {
                imdb: Some("tt1".into()),
                ..Default::default()
            },
        };
        assert_eq!(item.identity_key().unwrap(), "path:/mnt/x.mkv");
    }

    #[test]
    fn test_identity_key_falls_back_to_provider_order() {
        let item = ItemRef {
            source_item_id: "i1".into(),
            name: "x".into(),
            path: None,
            providers: ProviderIds {
                imdb: None,
                tmdb: Some("603".into()),
                tvdb: Some("73739".into()),
            },
        };
        assert_eq!(item.identity_key().unwrap(), "tmdb:603");
    }

    #[test]
    fn test_identity_key_none_without_identifiers() {
        let item = ItemRef {
            source_item_id: "i1".into(),
            name: "x".into(),
            path: Some(String::new()),
            providers: ProviderIds::default(),
        };
        assert!(item.identity_key().is_none());
    }

    #[test]
    fn test_providers_in_order() {
        let providers = ProviderIds {
            imdb: Some("tt1".into()),
            tmdb: None,
            tvdb: Some("99".into()),
        };
        let order: Vec<&str> = providers.in_order().iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(order, vec!["imdb", "tvdb"]);
    }

    #[test]
    fn test_merge_newer_value_wins() {
        let mut base = payload_with_position(100, ts(0));
        base.merge_newer(payload_with_position(200, ts(10)));
        assert_eq!(base.fields.position_ticks.unwrap().value, 200);
    }

    #[test]
    fn test_merge_older_value_is_ignored() {
        let mut base = payload_with_position(200, ts(10));
        base.merge_newer(payload_with_position(100, ts(0)));
        assert_eq!(base.fields.position_ticks.unwrap().value, 200);
    }

    #[test]
    fn test_merge_fills_absent_field() {
        let mut base = payload_with_position(100, ts(0));
        let mut incoming = payload_with_position(100, ts(0));
        incoming.fields.position_ticks = None;
        incoming.fields.played = Some(Stamped::new(true, ts(5)));
        base.merge_newer(incoming);
        assert_eq!(base.fields.position_ticks.unwrap().value, 100);
        assert!(base.fields.played.unwrap().value);
    }

    #[test]
    fn test_merge_keeps_played_to_completion_sticky() {
        let mut base = payload_with_position(100, ts(0));
        base.fields.played_to_completion = true;
        let incoming = payload_with_position(200, ts(10));
        base.merge_newer(incoming);
        assert!(base.fields.played_to_completion);
    }

    #[test]
    fn test_source_timestamp_is_newest_field() {
        let mut payload = payload_with_position(100, ts(0));
        payload.fields.favorite = Some(Stamped::new(true, ts(30)));
        assert_eq!(payload.source_timestamp().unwrap(), ts(30));
    }

    #[test]
    fn test_event_type_round_trip() {
        for et in [
            SyncEventType::Progress,
            SyncEventType::Watched,
            SyncEventType::Favorite,
            SyncEventType::Rating,
            SyncEventType::UserCreated,
            SyncEventType::UserDeleted,
            SyncEventType::PlaylistChange,
        ] {
            let json = serde_json::to_string(&et).unwrap();
            assert_eq!(json, format!("\"{}\"", et.as_str()));
            let back: SyncEventType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, et);
        }
    }

    #[test]
    fn test_field_for_cooldown() {
        assert_eq!(SyncEventType::Progress.field(), Some("position"));
        assert_eq!(SyncEventType::Watched.field(), Some("played"));
        assert_eq!(SyncEventType::UserCreated.field(), None);
        assert_eq!(SyncEventType::PlaylistChange.field(), None);
    }

    #[test]
    fn test_payload_json_round_trip() {
        let payload = payload_with_position(6_000_000_000, ts(0));
        let json = serde_json::to_string(&payload).unwrap();
        let back: EventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
