//! Background sync worker.
//!
//! Single cooperative loop: leases due events from the store, resolves
//! identities, applies last-write-wins comparisons against the target,
//! invokes the node API, and finalizes each event. Events are processed
//! sequentially: cooldown and coalesce handling must not race, and one
//! worker is enough for a small fleet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::models::{EventOutcome, ItemRef, PendingEvent, SyncEventType};
use crate::services::cooldown::CooldownMap;
use crate::services::node_client::{NodeApi, NodeError, NotFoundKind, UserItemData};
use crate::services::policy::PolicyEngine;
use crate::services::resolver::{IdentityResolver, ResolveError};
use crate::services::supervisor::NodeHealth;
use crate::store::Store;

/// Events leased per tick.
pub const LEASE_BATCH: i64 = 32;

/// Progress writes within this distance of the target's position are
/// considered already applied. 1 tick = 100 ns.
pub const PROGRESS_EPSILON_TICKS: i64 = 10 * 10_000_000;

const BACKOFF_BASE_SECS: i64 = 60;
const BACKOFF_CAP_SECS: i64 = 600;

/// Exponential backoff for transient failures:
/// `min(60 · 2^(attempt−1), 600)` seconds, attempt counted from 1.
pub fn backoff_delay(attempt: i64) -> i64 {
    let attempt = attempt.max(1);
    let exp = (attempt - 1).min(32) as u32;
    BACKOFF_BASE_SECS
        .saturating_mul(1_i64 << exp)
        .min(BACKOFF_CAP_SECS)
}

/// Render a tick count (100 ns units) as `HH:MM:SS`.
pub fn format_ticks(ticks: i64) -> String {
    let total_seconds = ticks.max(0) / 10_000_000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Skip reason for a progress write given the target's current state, or
/// None when the write should proceed.
pub fn progress_skip_reason(
    target: &UserItemData,
    source_ticks: i64,
    source_at: DateTime<Utc>,
) -> Option<&'static str> {
    if (target.position_ticks - source_ticks).abs() < PROGRESS_EPSILON_TICKS {
        return Some("already set");
    }
    if target.position_ticks > source_ticks
        && target.last_played_at.is_some_and(|at| at > source_at)
    {
        return Some("target newer");
    }
    None
}

fn rating_matches(target: Option<f64>, desired: f64) -> bool {
    target.is_some_and(|t| (t - desired).abs() < f64::EPSILON)
}

pub struct SyncWorker {
    config: Config,
    store: Store,
    clients: Arc<HashMap<String, Arc<dyn NodeApi>>>,
    resolver: IdentityResolver,
    policy: PolicyEngine,
    cooldowns: CooldownMap,
    node_health: Arc<NodeHealth>,
    cancel: CancellationToken,
}

impl SyncWorker {
    pub fn new(
        config: Config,
        store: Store,
        clients: Arc<HashMap<String, Arc<dyn NodeApi>>>,
        node_health: Arc<NodeHealth>,
        cancel: CancellationToken,
    ) -> Self {
        let resolver = IdentityResolver::new(store.clone(), clients.clone());
        let policy = PolicyEngine::new(config.path_sync_policy.clone());
        Self {
            config,
            store,
            clients,
            resolver,
            policy,
            cooldowns: CooldownMap::default(),
            node_health,
            cancel,
        }
    }

    fn client(&self, node: &str) -> Result<Arc<dyn NodeApi>, NodeError> {
        self.clients
            .get(node)
            .cloned()
            .ok_or_else(|| NodeError::Permanent(format!("node '{node}' is not configured")))
    }

    /// Run until cancelled. Leased events still in hand at shutdown are
    /// returned to the queue.
    pub async fn run(mut self) {
        let mut tick = interval(Duration::from_secs(
            self.config.sync.worker_interval_seconds.max(1),
        ));
        tracing::info!(
            interval_seconds = self.config.sync.worker_interval_seconds,
            "Sync worker started"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            self.cooldowns.sweep();
            self.drain_once().await;
            if self.cancel.is_cancelled() {
                break;
            }
        }

        tracing::info!("Sync worker stopped");
    }

    /// Lease and process one batch. One invocation per tick; exposed so
    /// tests can drive the pipeline without the timer.
    pub async fn drain_once(&mut self) {
        let now = Utc::now();
        let events = match self.store.lease_due(LEASE_BATCH, now).await {
            Ok(events) => events,
            Err(e) => {
                // Store trouble is fatal for this tick; try again next tick.
                tracing::error!(error = %e, "Failed to lease events");
                return;
            }
        };

        let mut remaining = events.into_iter();
        while let Some(event) = remaining.next() {
            if self.cancel.is_cancelled() {
                self.give_back(event, remaining.collect()).await;
                return;
            }
            let outcome = self.process_event(&event).await;
            if let Err(e) = self.store.finalize(&event, outcome, Utc::now()).await {
                tracing::error!(event_id = event.id, error = %e, "Failed to finalize event");
            }
        }
    }

    /// Return the current and remaining leased events to pending on shutdown.
    async fn give_back(&self, current: PendingEvent, rest: Vec<PendingEvent>) {
        let now = Utc::now();
        for event in std::iter::once(current).chain(rest) {
            let outcome = EventOutcome::Retry {
                delay_seconds: 0,
                reason: "shutdown".into(),
            };
            if let Err(e) = self.store.finalize(&event, outcome, now).await {
                tracing::error!(event_id = event.id, error = %e, "Failed to return leased event");
            }
        }
    }

    // ── Per-event pipeline ──────────────────────────────────────────────

    async fn process_event(&mut self, event: &PendingEvent) -> EventOutcome {
        // An event whose (user, item, field) tuple was just written TO its
        // source node is that write echoing back; an event whose target was
        // just written would be a second apply inside the window. Both are
        // dropped here, before any remote calls.
        if let (Some(field), Some(item_key)) = (event.event_type.field(), event.item_key.as_deref())
        {
            let echo = self
                .cooldowns
                .is_active(&event.source_node, &event.username, item_key, field);
            let recent_write = self
                .cooldowns
                .is_active(&event.target_node, &event.username, item_key, field);
            if echo || recent_write {
                return EventOutcome::Skipped {
                    reason: "cooldown".into(),
                };
            }
        }

        match event.event_type {
            SyncEventType::UserCreated => self.apply_user_created(event).await,
            SyncEventType::UserDeleted => self.apply_user_deleted(event).await,
            SyncEventType::PlaylistChange => self.apply_playlist_refresh(event).await,
            _ => self.apply_item_event(event).await,
        }
    }

    async fn apply_item_event(&mut self, event: &PendingEvent) -> EventOutcome {
        let now = Utc::now();
        let payload = &event.payload.0;
        let Some(item) = payload.item.as_ref() else {
            return EventOutcome::Failed {
                reason: "event carries no item descriptor".into(),
            };
        };

        // Resolve user on the target.
        let user_id = match self
            .resolver
            .resolve_user(&event.username, &event.target_node, now)
            .await
        {
            Ok(id) => id,
            Err(e) => return self.resolve_error_outcome(e, event),
        };

        // Resolve the item on the target.
        let item_id = match self
            .resolver
            .resolve_item(&event.target_node, item, now)
            .await
        {
            Ok(Some(id)) => id,
            Ok(None) => return self.item_absent_outcome(event, item),
            Err(e) => return self.resolve_error_outcome(e, event),
        };

        let client = match self.client(&event.target_node) {
            Ok(client) => client,
            Err(e) => return self.node_error_outcome(e, event),
        };

        // Read target state for the last-write-wins comparison.
        let target_state = match client.get_user_item_data(&user_id, &item_id).await {
            Ok(state) => state,
            Err(NodeError::NotFound {
                kind: NotFoundKind::Item,
            }) => {
                // The cached id points at an item that no longer exists.
                if let Err(e) = self.resolver.invalidate_item(&event.target_node, item).await {
                    tracing::warn!(event_id = event.id, error = %e, "Failed to drop stale item cache entry");
                }
                return self.item_absent_outcome(event, item);
            }
            Err(e) => return self.node_error_outcome(e, event),
        };

        let applied = match event.event_type {
            SyncEventType::Progress => {
                let Some(position) = payload.fields.position_ticks else {
                    return EventOutcome::Failed {
                        reason: "progress event carries no position".into(),
                    };
                };
                if let Some(reason) =
                    progress_skip_reason(&target_state, position.value, position.at)
                {
                    return EventOutcome::Skipped {
                        reason: reason.into(),
                    };
                }
                client
                    .set_progress(&user_id, &item_id, position.value)
                    .await
                    .map(|()| format!("position={}", format_ticks(position.value)))
            }
            SyncEventType::Watched => {
                let Some(played) = payload.fields.played else {
                    return EventOutcome::Failed {
                        reason: "watched event carries no played flag".into(),
                    };
                };
                if target_state.played == played.value {
                    return EventOutcome::Skipped {
                        reason: "already set".into(),
                    };
                }
                let result = if played.value {
                    client.mark_played(&user_id, &item_id, played.at).await
                } else {
                    client.mark_unplayed(&user_id, &item_id).await
                };
                result.map(|()| format!("played={}", played.value))
            }
            SyncEventType::Favorite => {
                let Some(favorite) = payload.fields.favorite else {
                    return EventOutcome::Failed {
                        reason: "favorite event carries no flag".into(),
                    };
                };
                if target_state.favorite == favorite.value {
                    return EventOutcome::Skipped {
                        reason: "already set".into(),
                    };
                }
                client
                    .set_favorite(&user_id, &item_id, favorite.value)
                    .await
                    .map(|()| format!("favorite={}", favorite.value))
            }
            SyncEventType::Rating => {
                let Some(rating) = payload.fields.rating else {
                    return EventOutcome::Failed {
                        reason: "rating event carries no value".into(),
                    };
                };
                if rating_matches(target_state.rating, rating.value) {
                    return EventOutcome::Skipped {
                        reason: "already set".into(),
                    };
                }
                client
                    .set_rating(&user_id, &item_id, Some(rating.value))
                    .await
                    .map(|()| format!("rating={}", rating.value))
            }
            _ => unreachable!("lifecycle events handled separately"),
        };

        match applied {
            Ok(synced_value) => {
                if let (Some(field), Some(item_key)) =
                    (event.event_type.field(), event.item_key.as_deref())
                {
                    self.cooldowns
                        .arm(&event.target_node, &event.username, item_key, field);
                }
                tracing::info!(
                    source = %event.source_node,
                    target = %event.target_node,
                    user = %event.username,
                    event_type = %event.event_type,
                    value = %synced_value,
                    "Applied event"
                );
                EventOutcome::Applied {
                    synced_value: Some(synced_value),
                }
            }
            Err(NodeError::NotFound {
                kind: NotFoundKind::Item,
            }) => {
                if let Err(e) = self.resolver.invalidate_item(&event.target_node, item).await {
                    tracing::warn!(event_id = event.id, error = %e, "Failed to drop stale item cache entry");
                }
                self.item_absent_outcome(event, item)
            }
            Err(e) => self.node_error_outcome(e, event),
        }
    }

    // ── User lifecycle and playlists ────────────────────────────────────

    async fn apply_user_created(&self, event: &PendingEvent) -> EventOutcome {
        let payload = &event.payload.0;
        let client = match self.client(&event.target_node) {
            Ok(client) => client,
            Err(e) => return self.node_error_outcome(e, event),
        };

        match client
            .create_user(&payload.user.username, payload.fields.password.as_deref())
            .await
        {
            Ok(remote_id) => {
                if let Err(e) = self
                    .store
                    .put_user_mapping(&event.username, &event.target_node, &remote_id, Utc::now())
                    .await
                {
                    tracing::warn!(event_id = event.id, error = %e, "Failed to cache new user mapping");
                }
                EventOutcome::Applied {
                    synced_value: Some("user created".into()),
                }
            }
            Err(e) => self.node_error_outcome(e, event),
        }
    }

    async fn apply_user_deleted(&self, event: &PendingEvent) -> EventOutcome {
        let now = Utc::now();
        let user_id = match self
            .resolver
            .resolve_user(&event.username, &event.target_node, now)
            .await
        {
            Ok(id) => id,
            Err(ResolveError::NoMatchingUser) => {
                return EventOutcome::Skipped {
                    reason: "user already absent".into(),
                };
            }
            Err(e) => return self.resolve_error_outcome(e, event),
        };

        let client = match self.client(&event.target_node) {
            Ok(client) => client,
            Err(e) => return self.node_error_outcome(e, event),
        };

        let result = match client.delete_user(&user_id).await {
            Ok(()) => EventOutcome::Applied {
                synced_value: Some("user deleted".into()),
            },
            Err(NodeError::NotFound {
                kind: NotFoundKind::User,
            }) => EventOutcome::Skipped {
                reason: "user already absent".into(),
            },
            Err(e) => return self.node_error_outcome(e, event),
        };

        // The remote ids are gone or going everywhere; cached mappings for
        // this username must not outlive the account.
        if let Err(e) = self.store.invalidate_user(&event.username).await {
            tracing::warn!(event_id = event.id, error = %e, "Failed to invalidate user mappings");
        }
        result
    }

    /// The playlist notification carries no delta, so converge by name:
    /// any playlist present on the source and missing on the target is
    /// created there.
    async fn apply_playlist_refresh(&self, event: &PendingEvent) -> EventOutcome {
        let now = Utc::now();
        let payload = &event.payload.0;

        let source_client = match self.client(&event.source_node) {
            Ok(client) => client,
            Err(e) => return self.node_error_outcome(e, event),
        };
        let target_client = match self.client(&event.target_node) {
            Ok(client) => client,
            Err(e) => return self.node_error_outcome(e, event),
        };

        let source_user = if payload.user.source_user_id.is_empty() {
            match self
                .resolver
                .resolve_user(&event.username, &event.source_node, now)
                .await
            {
                Ok(id) => id,
                Err(e) => return self.resolve_error_outcome(e, event),
            }
        } else {
            payload.user.source_user_id.clone()
        };
        let target_user = match self
            .resolver
            .resolve_user(&event.username, &event.target_node, now)
            .await
        {
            Ok(id) => id,
            Err(e) => return self.resolve_error_outcome(e, event),
        };

        let source_lists = match source_client.list_playlists(&source_user).await {
            Ok(lists) => lists,
            Err(e) => return self.node_error_outcome(e, event),
        };
        let target_lists = match target_client.list_playlists(&target_user).await {
            Ok(lists) => lists,
            Err(e) => return self.node_error_outcome(e, event),
        };

        let existing: Vec<String> = target_lists
            .iter()
            .map(|p| p.name.to_lowercase())
            .collect();
        let mut created = 0usize;
        for playlist in &source_lists {
            if !existing.contains(&playlist.name.to_lowercase()) {
                if let Err(e) = target_client.create_playlist(&target_user, &playlist.name).await {
                    return self.node_error_outcome(e, event);
                }
                created += 1;
            }
        }

        if created == 0 {
            EventOutcome::Skipped {
                reason: "playlists in sync".into(),
            }
        } else {
            EventOutcome::Applied {
                synced_value: Some(format!("playlists created={created}")),
            }
        }
    }

    // ── Outcome classification ──────────────────────────────────────────

    fn resolve_error_outcome(&self, err: ResolveError, event: &PendingEvent) -> EventOutcome {
        match err {
            ResolveError::NoMatchingUser => EventOutcome::Failed {
                reason: format!(
                    "no matching user '{}' on {}",
                    event.username, event.target_node
                ),
            },
            ResolveError::Node(e) => self.node_error_outcome(e, event),
            ResolveError::Store(e) => {
                tracing::error!(event_id = event.id, error = %e, "Store error during resolution");
                EventOutcome::Retry {
                    delay_seconds: self.config.sync.worker_interval_seconds as i64,
                    reason: "store error".into(),
                }
            }
        }
    }

    fn node_error_outcome(&self, err: NodeError, event: &PendingEvent) -> EventOutcome {
        match err {
            NodeError::Transient(cause) => EventOutcome::Retry {
                delay_seconds: backoff_delay(event.attempts + 1),
                reason: cause,
            },
            NodeError::Permanent(cause) => EventOutcome::Failed { reason: cause },
            NodeError::Unauthorized(cause) => {
                self.node_health.mark_sync(&event.target_node, false);
                EventOutcome::Failed {
                    reason: format!("unauthorized on {}: {cause}", event.target_node),
                }
            }
            NodeError::NotFound { kind } => EventOutcome::Failed {
                reason: format!("{kind} not found on {}", event.target_node),
            },
        }
    }

    fn item_absent_outcome(&self, event: &PendingEvent, item: &ItemRef) -> EventOutcome {
        let policy = self.policy.policy_for(item.path.as_deref());

        if policy.max_attempts == 0 {
            return EventOutcome::Failed {
                reason: "item not found".into(),
            };
        }

        let next_count = event.item_not_found_count + 1;
        if !policy.is_unbounded() && next_count > policy.max_attempts {
            return EventOutcome::Failed {
                reason: format!("item not found (gave up after {next_count} attempts)"),
            };
        }

        let budget = if policy.is_unbounded() {
            "∞".to_string()
        } else {
            policy.max_attempts.to_string()
        };
        EventOutcome::WaitItem {
            delay_seconds: policy.delay_seconds,
            max: policy.max_attempts,
            reason: format!("item not found (attempt {next_count}/{budget})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── backoff_delay ───────────────────────────────────────────────────

    #[test]
    fn test_backoff_first_attempt() {
        assert_eq!(backoff_delay(1), 60);
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff_delay(2), 120);
        assert_eq!(backoff_delay(3), 240);
        assert_eq!(backoff_delay(4), 480);
    }

    #[test]
    fn test_backoff_capped_at_600() {
        assert_eq!(backoff_delay(5), 600);
        assert_eq!(backoff_delay(50), 600);
    }

    #[test]
    fn test_backoff_zero_attempt_treated_as_first() {
        assert_eq!(backoff_delay(0), 60);
    }

    // ── format_ticks ────────────────────────────────────────────────────

    #[test]
    fn test_format_ticks_ten_minutes() {
        // 10 min = 6_000_000_000 ticks
        assert_eq!(format_ticks(6_000_000_000), "00:10:00");
    }

    #[test]
    fn test_format_ticks_with_hours() {
        let ticks = ((2 * 3600) + (23 * 60) + 11) * 10_000_000;
        assert_eq!(format_ticks(ticks), "02:23:11");
    }

    #[test]
    fn test_format_ticks_zero() {
        assert_eq!(format_ticks(0), "00:00:00");
    }

    #[test]
    fn test_format_ticks_negative_clamped() {
        assert_eq!(format_ticks(-5), "00:00:00");
    }

    // ── progress_skip_reason ────────────────────────────────────────────

    fn target(position_ticks: i64, last_played_at: Option<DateTime<Utc>>) -> UserItemData {
        UserItemData {
            position_ticks,
            last_played_at,
            ..Default::default()
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_progress_within_epsilon_is_already_set() {
        // 9 seconds apart, under the 10 s epsilon.
        let reason = progress_skip_reason(
            &target(6_000_000_000, None),
            6_000_000_000 + 9 * 10_000_000,
            at("2026-05-01T12:00:00Z"),
        );
        assert_eq!(reason, Some("already set"));
    }

    #[test]
    fn test_progress_at_epsilon_boundary_applies() {
        // Exactly 10 seconds apart is not "already set".
        let reason = progress_skip_reason(
            &target(6_000_000_000, None),
            6_000_000_000 + 10 * 10_000_000,
            at("2026-05-01T12:00:00Z"),
        );
        assert_eq!(reason, None);
    }

    #[test]
    fn test_progress_target_ahead_and_newer_is_skipped() {
        let reason = progress_skip_reason(
            &target(9_000_000_000, Some(at("2026-05-01T12:05:00Z"))),
            6_000_000_000,
            at("2026-05-01T12:00:00Z"),
        );
        assert_eq!(reason, Some("target newer"));
    }

    #[test]
    fn test_progress_target_ahead_but_older_applies() {
        // Target is further in but was written before the source change:
        // the user rewound on the source, and that wins.
        let reason = progress_skip_reason(
            &target(9_000_000_000, Some(at("2026-05-01T11:00:00Z"))),
            6_000_000_000,
            at("2026-05-01T12:00:00Z"),
        );
        assert_eq!(reason, None);
    }

    #[test]
    fn test_progress_target_ahead_without_timestamp_applies() {
        let reason = progress_skip_reason(
            &target(9_000_000_000, None),
            6_000_000_000,
            at("2026-05-01T12:00:00Z"),
        );
        assert_eq!(reason, None);
    }

    #[test]
    fn test_progress_source_ahead_applies() {
        let reason = progress_skip_reason(
            &target(1_000_000_000, Some(at("2026-05-01T12:05:00Z"))),
            6_000_000_000,
            at("2026-05-01T12:00:00Z"),
        );
        assert_eq!(reason, None);
    }

    // ── rating_matches ──────────────────────────────────────────────────

    #[test]
    fn test_rating_matches_equal() {
        assert!(rating_matches(Some(8.5), 8.5));
    }

    #[test]
    fn test_rating_matches_differs() {
        assert!(!rating_matches(Some(7.0), 8.5));
        assert!(!rating_matches(None, 8.5));
    }
}
