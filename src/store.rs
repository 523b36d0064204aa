//! Durable store: pending-event queue, identity caches, sync log.
//!
//! Single logical writer (the worker, with the ingestor serialized behind
//! the same pool); readers take WAL snapshots and never block the writer.
//! Every queue transition is one transaction so a crash between lease and
//! finalize leaves rows recoverable by `reap_orphans`.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::types::Json;
use sqlx::QueryBuilder;

use crate::error::Result;
use crate::models::{
    EventIntent, EventOutcome, EventPayload, EventStatus, PendingEvent, SyncLogEntry,
    SyncLogFilter,
};

/// Counts of resident queue rows by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: i64,
    pub processing: i64,
    pub waiting_item: i64,
}

/// Aggregate sync-log statistics.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    max_retries: i64,
}

impl Store {
    pub fn new(pool: SqlitePool, max_retries: i64) -> Self {
        Self { pool, max_retries }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Cheap connectivity probe for readiness.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    // ── Pending events ──────────────────────────────────────────────────

    /// Enqueue all intents of one webhook in a single transaction.
    ///
    /// Upsert keyed by `dedup_key`: an existing row in a non-terminal,
    /// non-leased state absorbs the new payload (newer field timestamps
    /// win), gets `next_retry_at` reset to now, and keeps its retry
    /// counters. Returns the affected row ids.
    pub async fn enqueue_all(&self, intents: &[EventIntent], now: DateTime<Utc>) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(intents.len());

        for intent in intents {
            let existing: Option<(i64, Json<EventPayload>)> = sqlx::query_as(
                r#"
                SELECT id, payload FROM pending_events
                WHERE dedup_key = ?1 AND state IN ('pending', 'waiting_item')
                LIMIT 1
                "#,
            )
            .bind(&intent.dedup_key)
            .fetch_optional(&mut *tx)
            .await?;

            let id = match existing {
                Some((id, Json(mut payload))) => {
                    payload.merge_newer(intent.payload.clone());
                    sqlx::query(
                        r#"
                        UPDATE pending_events
                        SET payload = ?2, item_name = ?3, state = 'pending',
                            next_retry_at = ?4, updated_at = ?4
                        WHERE id = ?1
                        "#,
                    )
                    .bind(id)
                    .bind(Json(&payload))
                    .bind(&intent.item_name)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    tracing::debug!(event_id = id, dedup_key = %intent.dedup_key, "Coalesced event");
                    id
                }
                None => {
                    let (id,): (i64,) = sqlx::query_as(
                        r#"
                        INSERT INTO pending_events
                            (dedup_key, event_type, source_node, target_node, username,
                             item_key, item_name, payload, state,
                             next_retry_at, created_at, updated_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?9, ?9)
                        RETURNING id
                        "#,
                    )
                    .bind(&intent.dedup_key)
                    .bind(intent.event_type)
                    .bind(&intent.source_node)
                    .bind(&intent.target_node)
                    .bind(&intent.username)
                    .bind(&intent.item_key)
                    .bind(&intent.item_name)
                    .bind(Json(&intent.payload))
                    .bind(now)
                    .fetch_one(&mut *tx)
                    .await?;
                    tracing::info!(
                        event_id = id,
                        event_type = %intent.event_type,
                        source = %intent.source_node,
                        target = %intent.target_node,
                        user = %intent.username,
                        "Queued event"
                    );
                    id
                }
            };
            ids.push(id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Lease up to `limit` due rows: pending or waiting_item with
    /// `next_retry_at <= now` transition to processing atomically.
    pub async fn lease_due(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<PendingEvent>> {
        let mut events: Vec<PendingEvent> = sqlx::query_as(
            r#"
            UPDATE pending_events
            SET state = 'processing', updated_at = ?2
            WHERE id IN (
                SELECT id FROM pending_events
                WHERE state IN ('pending', 'waiting_item') AND next_retry_at <= ?1
                ORDER BY next_retry_at ASC
                LIMIT ?3
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        events.sort_by(|a, b| a.next_retry_at.cmp(&b.next_retry_at).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    /// Settle a leased event. Terminal outcomes (applied, skipped, failed,
    /// retry budget exhausted) remove the row and append a sync-log entry;
    /// retry and wait_item park it again with a new `next_retry_at`.
    pub async fn finalize(
        &self,
        event: &PendingEvent,
        outcome: EventOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match outcome {
            EventOutcome::Applied { synced_value } => {
                self.remove_and_log(event, true, synced_value, "synced".to_string(), now)
                    .await
            }
            EventOutcome::Skipped { reason } => {
                tracing::debug!(event_id = event.id, reason = %reason, "Event skipped");
                self.remove_and_log(event, true, None, reason, now).await
            }
            EventOutcome::Failed { reason } => {
                tracing::warn!(event_id = event.id, reason = %reason, "Event failed");
                self.remove_and_log(event, false, None, reason, now).await
            }
            EventOutcome::Retry {
                delay_seconds,
                reason,
            } => {
                let attempts = event.attempts + 1;
                if attempts >= self.max_retries {
                    let message = format!("failed after {attempts} attempts: {reason}");
                    tracing::warn!(event_id = event.id, %message, "Retry budget exhausted");
                    return self.remove_and_log(event, false, None, message, now).await;
                }
                tracing::debug!(
                    event_id = event.id,
                    attempts,
                    delay_seconds,
                    reason = %reason,
                    "Event scheduled for retry"
                );
                sqlx::query(
                    r#"
                    UPDATE pending_events
                    SET state = 'pending', attempts = ?2, last_error = ?3,
                        next_retry_at = ?4, updated_at = ?5
                    WHERE id = ?1
                    "#,
                )
                .bind(event.id)
                .bind(attempts)
                .bind(&reason)
                .bind(now + Duration::seconds(delay_seconds))
                .bind(now)
                .execute(&self.pool)
                .await?;
                Ok(())
            }
            EventOutcome::WaitItem {
                delay_seconds,
                max,
                reason,
            } => {
                tracing::info!(
                    event_id = event.id,
                    delay_seconds,
                    reason = %reason,
                    "Waiting for item to appear on target"
                );
                sqlx::query(
                    r#"
                    UPDATE pending_events
                    SET state = 'waiting_item',
                        item_not_found_count = item_not_found_count + 1,
                        item_not_found_max = ?2, last_error = ?3,
                        next_retry_at = ?4, updated_at = ?5
                    WHERE id = ?1
                    "#,
                )
                .bind(event.id)
                .bind(max)
                .bind(&reason)
                .bind(now + Duration::seconds(delay_seconds))
                .bind(now)
                .execute(&self.pool)
                .await?;
                Ok(())
            }
        }
    }

    async fn remove_and_log(
        &self,
        event: &PendingEvent,
        success: bool,
        synced_value: Option<String>,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO sync_log
                (event_type, source_node, target_node, username, item_name,
                 synced_value, success, message, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(event.event_type)
        .bind(&event.source_node)
        .bind(&event.target_node)
        .bind(&event.username)
        .bind(&event.item_name)
        .bind(&synced_value)
        .bind(success)
        .bind(&message)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM pending_events WHERE id = ?1")
            .bind(event.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Startup recovery: rows stuck in processing from a previous run
    /// return to pending.
    pub async fn reap_orphans(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE pending_events
            SET state = 'pending', next_retry_at = ?1, updated_at = ?1
            WHERE state = 'processing'
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            tracing::info!(
                count = result.rows_affected(),
                "Recovered orphaned processing events"
            );
        }
        Ok(result.rows_affected())
    }

    /// Latest non-leased progress row for a `(source, user, item, target)`
    /// tuple; the ingest-side debounce coalesces into it while its
    /// `updated_at` is inside the window.
    pub async fn latest_pending_progress(
        &self,
        source_node: &str,
        username: &str,
        item_key: &str,
        target_node: &str,
    ) -> Result<Option<(String, DateTime<Utc>)>> {
        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT dedup_key, updated_at FROM pending_events
            WHERE event_type = 'progress'
              AND source_node = ?1 AND username = ?2
              AND item_key = ?3 AND target_node = ?4
              AND state IN ('pending', 'waiting_item')
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(source_node)
        .bind(username)
        .bind(item_key)
        .bind(target_node)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Read-only projection of queue rows in one state, oldest first.
    pub async fn list_events(&self, state: EventStatus, limit: i64) -> Result<Vec<PendingEvent>> {
        let events = sqlx::query_as(
            r#"
            SELECT * FROM pending_events
            WHERE state = ?1
            ORDER BY created_at ASC
            LIMIT ?2
            "#,
        )
        .bind(state)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        let (pending, processing, waiting_item): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'processing' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'waiting_item' THEN 1 ELSE 0 END), 0)
            FROM pending_events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueCounts {
            pending,
            processing,
            waiting_item,
        })
    }

    // ── User mappings ───────────────────────────────────────────────────

    pub async fn get_user_mapping(
        &self,
        username: &str,
        node_name: &str,
    ) -> Result<Option<crate::models::UserMapping>> {
        let mapping = sqlx::query_as(
            "SELECT * FROM user_mappings WHERE username = ?1 AND node_name = ?2",
        )
        .bind(username.to_lowercase())
        .bind(node_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(mapping)
    }

    pub async fn put_user_mapping(
        &self,
        username: &str,
        node_name: &str,
        remote_user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_mappings (username, node_name, remote_user_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(username, node_name)
            DO UPDATE SET remote_user_id = excluded.remote_user_id,
                          updated_at = excluded.updated_at
            "#,
        )
        .bind(username.to_lowercase())
        .bind(node_name)
        .bind(remote_user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop every node's mapping for a username (UserDeleted fan-out).
    pub async fn invalidate_user(&self, username: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM user_mappings WHERE username = ?1")
            .bind(username.to_lowercase())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn all_user_mappings(&self) -> Result<Vec<crate::models::UserMapping>> {
        let mappings =
            sqlx::query_as("SELECT * FROM user_mappings ORDER BY username, node_name")
                .fetch_all(&self.pool)
                .await?;
        Ok(mappings)
    }

    pub async fn user_mapping_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM user_mappings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ── Item cache ──────────────────────────────────────────────────────

    pub async fn get_item_cache(
        &self,
        node_name: &str,
        lookup_key: &str,
    ) -> Result<Option<crate::models::ItemCacheEntry>> {
        let entry = sqlx::query_as(
            "SELECT * FROM item_cache WHERE node_name = ?1 AND lookup_key = ?2",
        )
        .bind(node_name)
        .bind(lookup_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    pub async fn put_item_cache(
        &self,
        node_name: &str,
        lookup_key: &str,
        remote_item_id: &str,
        item_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO item_cache (node_name, lookup_key, remote_item_id, item_name, fetched_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(node_name, lookup_key)
            DO UPDATE SET remote_item_id = excluded.remote_item_id,
                          item_name = excluded.item_name,
                          fetched_at = excluded.fetched_at
            "#,
        )
        .bind(node_name)
        .bind(lookup_key)
        .bind(remote_item_id)
        .bind(item_name)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn invalidate_item(&self, node_name: &str, lookup_key: &str) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM item_cache WHERE node_name = ?1 AND lookup_key = ?2")
                .bind(node_name)
                .bind(lookup_key)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn item_cache_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM item_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ── Sync log ────────────────────────────────────────────────────────

    /// Filtered page of sync-log entries, newest first, plus the total
    /// count matching the filter.
    pub async fn query_sync_log(
        &self,
        filter: &SyncLogFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<SyncLogEntry>, i64)> {
        let cutoff = filter
            .since_minutes
            .map(|m| Utc::now() - Duration::minutes(m));

        let mut count_query: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM sync_log WHERE 1=1");
        let mut data_query: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT * FROM sync_log WHERE 1=1");

        for builder in [&mut count_query, &mut data_query] {
            if let Some(source) = &filter.source_node {
                builder.push(" AND source_node = ").push_bind(source.clone());
            }
            if let Some(target) = &filter.target_node {
                builder.push(" AND target_node = ").push_bind(target.clone());
            }
            if let Some(event_type) = &filter.event_type {
                builder.push(" AND event_type = ").push_bind(event_type.clone());
            }
            if let Some(item_name) = &filter.item_name {
                builder
                    .push(" AND item_name LIKE ")
                    .push_bind(format!("%{item_name}%"));
            }
            if let Some(cutoff) = cutoff {
                builder.push(" AND created_at >= ").push_bind(cutoff);
            }
        }

        let (total,): (i64,) = count_query.build_query_as().fetch_one(&self.pool).await?;

        data_query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let entries = data_query.build_query_as().fetch_all(&self.pool).await?;

        Ok((entries, total))
    }

    pub async fn sync_stats(&self) -> Result<SyncStats> {
        let (total, successful, failed, last_sync_at): (i64, i64, i64, Option<DateTime<Utc>>) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0),
                    MAX(created_at)
                FROM sync_log
                "#,
            )
            .fetch_one(&self.pool)
            .await?;
        Ok(SyncStats {
            total,
            successful,
            failed,
            last_sync_at,
        })
    }

    pub async fn sync_log_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
