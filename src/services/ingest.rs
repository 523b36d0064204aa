//! Webhook ingestion: normalize one inbound notification into per-target
//! event intents and enqueue them atomically.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{
    EventIntent, EventPayload, FieldSet, ItemRef, NotificationType, ProviderIds, Stamped,
    SyncEventType, UserRef, WebhookPayload,
};
use crate::store::Store;

/// Acknowledgement returned to the origin node. Enqueueing is the only
/// synchronous effect; the apply happens later on the worker.
#[derive(Debug, Serialize, ToSchema)]
pub struct IngestAck {
    pub status: String,
    pub event_ids: Vec<i64>,
    /// Credentials generated for user-creation fan-out, surfaced so an
    /// operator can distribute them.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub created_users: Vec<CreatedUserAck>,
}

impl IngestAck {
    fn skipped(reason: &str) -> Self {
        Self {
            status: format!("skipped: {reason}"),
            event_ids: Vec::new(),
            created_users: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreatedUserAck {
    pub target_node: String,
    pub username: String,
    /// None when the target is passwordless.
    pub password: Option<String>,
}

/// Generate a password for a user created on a passwordful node.
/// URL-safe alphabet so it survives copy-paste into any client.
pub(crate) fn generate_password() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut rng = rand::rng();
    (0..16)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Compute the queue fingerprint. Progress events additionally carry a
/// debounce-window bucket so a new burst after the window opens a new row.
pub(crate) fn dedup_key(
    event_type: SyncEventType,
    source_node: &str,
    source_user: &str,
    item_key: &str,
    target_node: &str,
    progress_bucket: Option<i64>,
) -> String {
    match progress_bucket {
        Some(bucket) => format!(
            "{}:{}:{}:{}:{}:{}",
            event_type.as_str(),
            source_node,
            source_user,
            item_key,
            target_node,
            bucket
        ),
        None => format!(
            "{}:{}:{}:{}:{}",
            event_type.as_str(),
            source_node,
            source_user,
            item_key,
            target_node
        ),
    }
}

pub struct EventIngestor {
    config: Config,
    store: Store,
}

impl EventIngestor {
    pub fn new(config: Config, store: Store) -> Self {
        Self { config, store }
    }

    /// Normalize `payload` from the origin node and enqueue up to N-1
    /// intents in one store transaction.
    pub async fn ingest(
        &self,
        origin: &str,
        payload: &WebhookPayload,
        received_at: DateTime<Utc>,
    ) -> Result<IngestAck> {
        if self.config.node(origin).is_none() {
            return Err(AppError::UnknownSource(origin.to_string()));
        }

        if payload.username.is_empty() {
            tracing::debug!(origin, kind = %payload.notification_type, "Webhook without username");
            return Ok(IngestAck::skipped("no username"));
        }

        let Some(kind) = payload.kind() else {
            tracing::debug!(origin, kind = %payload.notification_type, "Unhandled notification type");
            return Ok(IngestAck::skipped("unhandled notification type"));
        };

        let username = payload.username.to_lowercase();
        let ts = payload.source_timestamp(received_at);

        tracing::debug!(
            origin,
            kind = %payload.notification_type,
            user = %username,
            item = %payload.item_name,
            path = payload.item_path.as_deref().unwrap_or(""),
            "Received webhook"
        );

        // Keep the source node's own mapping warm.
        if !payload.user_id.is_empty() {
            self.store
                .put_user_mapping(&username, origin, &payload.user_id, received_at)
                .await?;
        }

        let item = ItemRef {
            source_item_id: payload.item_id.clone(),
            name: payload.item_name.clone(),
            path: payload.item_path.clone(),
            providers: ProviderIds {
                imdb: payload.provider_imdb.clone(),
                tmdb: payload.provider_tmdb.clone(),
                tvdb: payload.provider_tvdb.clone(),
            },
        };
        let user = UserRef {
            source_user_id: payload.user_id.clone(),
            username: payload.username.clone(),
        };

        let mut intents = Vec::new();
        let mut created_users = Vec::new();

        match kind {
            NotificationType::UserCreated => {
                for target in self.config.other_nodes(origin) {
                    let password = (!target.passwordless).then(generate_password);
                    created_users.push(CreatedUserAck {
                        target_node: target.name.clone(),
                        username: payload.username.clone(),
                        password: password.clone(),
                    });
                    intents.push(self.user_intent(
                        SyncEventType::UserCreated,
                        origin,
                        &target.name,
                        &username,
                        &user,
                        password,
                    ));
                }
            }
            NotificationType::UserDeleted => {
                for target in self.config.other_nodes(origin) {
                    intents.push(self.user_intent(
                        SyncEventType::UserDeleted,
                        origin,
                        &target.name,
                        &username,
                        &user,
                        None,
                    ));
                }
            }
            // Carries no item or delta; the worker reconciles playlists by
            // name, so the intent only needs the user.
            NotificationType::PlaylistChange => {
                if self.config.sync.playlists {
                    for target in self.config.other_nodes(origin) {
                        intents.push(self.user_intent(
                            SyncEventType::PlaylistChange,
                            origin,
                            &target.name,
                            &username,
                            &user,
                            None,
                        ));
                    }
                }
            }
            _ => {
                let kinds = self.item_event_kinds(kind, payload, ts);
                if kinds.is_empty() {
                    return Ok(IngestAck::skipped("nothing to sync"));
                }
                let Some(item_key) = item.identity_key() else {
                    tracing::debug!(origin, item = %payload.item_name, "Item has no identity key");
                    return Ok(IngestAck::skipped("item has no path or provider ids"));
                };
                for (event_type, fields) in kinds {
                    for target in self.config.other_nodes(origin) {
                        let intent = self
                            .item_intent(
                                event_type,
                                origin,
                                &target.name,
                                &username,
                                &user,
                                &item,
                                &item_key,
                                fields.clone(),
                                ts,
                                received_at,
                            )
                            .await?;
                        intents.push(intent);
                    }
                }
            }
        }

        let event_ids = self.store.enqueue_all(&intents, received_at).await?;
        tracing::debug!(origin, count = event_ids.len(), "Enqueued webhook intents");

        Ok(IngestAck {
            status: "enqueued".into(),
            event_ids,
            created_users,
        })
    }

    /// Map a notification to the event kinds it produces, honoring the
    /// per-kind sync switches.
    fn item_event_kinds(
        &self,
        kind: NotificationType,
        payload: &WebhookPayload,
        ts: DateTime<Utc>,
    ) -> Vec<(SyncEventType, FieldSet)> {
        let sync = &self.config.sync;
        let mut kinds = Vec::new();

        match kind {
            NotificationType::PlaybackStop => {
                if payload.played_to_completion && sync.watched_status {
                    kinds.push((
                        SyncEventType::Watched,
                        FieldSet {
                            played: Some(Stamped::new(true, ts)),
                            played_to_completion: true,
                            ..Default::default()
                        },
                    ));
                }
            }
            NotificationType::PlaybackProgress => {
                if sync.playback_progress {
                    if let Some(ticks) = payload.playback_position_ticks {
                        kinds.push((
                            SyncEventType::Progress,
                            FieldSet {
                                position_ticks: Some(Stamped::new(ticks, ts)),
                                played_to_completion: payload.played_to_completion,
                                ..Default::default()
                            },
                        ));
                    }
                }
                if payload.played_to_completion && sync.watched_status {
                    kinds.push((
                        SyncEventType::Watched,
                        FieldSet {
                            played: Some(Stamped::new(true, ts)),
                            played_to_completion: true,
                            ..Default::default()
                        },
                    ));
                }
            }
            NotificationType::UserDataSaved => {
                // Bulk restore/migration writes; fanning these out would
                // flood the queue.
                if payload.save_reason.as_deref() == Some("Import") {
                    tracing::debug!(item = %payload.item_name, "Skipping Import save");
                    return kinds;
                }
                if sync.watched_status {
                    kinds.push((
                        SyncEventType::Watched,
                        FieldSet {
                            played: Some(Stamped::new(payload.is_played, ts)),
                            ..Default::default()
                        },
                    ));
                }
                if sync.favorites {
                    kinds.push((
                        SyncEventType::Favorite,
                        FieldSet {
                            favorite: Some(Stamped::new(payload.is_favorite, ts)),
                            ..Default::default()
                        },
                    ));
                }
                if sync.ratings {
                    if let Some(rating) = payload.rating {
                        kinds.push((
                            SyncEventType::Rating,
                            FieldSet {
                                rating: Some(Stamped::new(rating, ts)),
                                ..Default::default()
                            },
                        ));
                    }
                }
            }
            NotificationType::UserCreated
            | NotificationType::UserDeleted
            | NotificationType::PlaylistChange => {}
        }

        kinds
    }

    fn user_intent(
        &self,
        event_type: SyncEventType,
        origin: &str,
        target: &str,
        username: &str,
        user: &UserRef,
        password: Option<String>,
    ) -> EventIntent {
        let item_key = format!("user:{username}");
        let source_user = if user.source_user_id.is_empty() {
            username
        } else {
            &user.source_user_id
        };
        EventIntent {
            dedup_key: dedup_key(event_type, origin, source_user, &item_key, target, None),
            event_type,
            source_node: origin.to_string(),
            target_node: target.to_string(),
            username: username.to_string(),
            item_key: Some(item_key),
            item_name: None,
            payload: EventPayload {
                user: user.clone(),
                item: None,
                fields: FieldSet {
                    password,
                    ..Default::default()
                },
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn item_intent(
        &self,
        event_type: SyncEventType,
        origin: &str,
        target: &str,
        username: &str,
        user: &UserRef,
        item: &ItemRef,
        item_key: &str,
        fields: FieldSet,
        ts: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EventIntent> {
        let mut key = dedup_key(
            event_type,
            origin,
            &user.source_user_id,
            item_key,
            target,
            (event_type == SyncEventType::Progress)
                .then(|| progress_bucket(ts, self.config.sync.progress_debounce_seconds)),
        );

        // Ingest-side debounce: a pending progress row for the same tuple
        // whose last update is inside the window absorbs the new value
        // instead of opening a fresh row. Completion events bypass this so
        // the final position always lands.
        if event_type == SyncEventType::Progress && !fields.played_to_completion {
            if let Some((existing_key, updated_at)) = self
                .store
                .latest_pending_progress(origin, username, item_key, target)
                .await?
            {
                let age = (now - updated_at).num_seconds();
                if age >= 0 && age < self.config.sync.progress_debounce_seconds {
                    key = existing_key;
                }
            }
        }

        Ok(EventIntent {
            dedup_key: key,
            event_type,
            source_node: origin.to_string(),
            target_node: target.to_string(),
            username: username.to_string(),
            item_key: Some(item_key.to_string()),
            item_name: Some(item.name.clone()),
            payload: EventPayload {
                user: user.clone(),
                item: Some(item.clone()),
                fields,
            },
        })
    }
}

/// Bucket index of a source timestamp inside the debounce window.
pub(crate) fn progress_bucket(ts: DateTime<Utc>, window_seconds: i64) -> i64 {
    if window_seconds <= 0 {
        return ts.timestamp();
    }
    ts.timestamp().div_euclid(window_seconds)
}
