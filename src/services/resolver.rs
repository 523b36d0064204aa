//! Cross-node identity resolution.
//!
//! Translates the source-side user and item descriptors carried by an
//! event into the target node's ids, going through the store's caches
//! first and falling back to node queries. Positive results are memoized;
//! negative item lookups are not (the item may be imported later).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result as AppResult;
use crate::models::{ItemRef, Provider};
use crate::services::node_client::{NodeApi, NodeError};
use crate::store::Store;

pub struct IdentityResolver {
    store: Store,
    clients: Arc<HashMap<String, Arc<dyn NodeApi>>>,
}

/// Why a user could not be resolved on the target.
#[derive(Debug)]
pub enum ResolveError {
    /// No user with a matching name exists on the target node.
    NoMatchingUser,
    Node(NodeError),
    Store(crate::error::AppError),
}

impl From<NodeError> for ResolveError {
    fn from(err: NodeError) -> Self {
        Self::Node(err)
    }
}

impl From<crate::error::AppError> for ResolveError {
    fn from(err: crate::error::AppError) -> Self {
        Self::Store(err)
    }
}

impl IdentityResolver {
    pub fn new(store: Store, clients: Arc<HashMap<String, Arc<dyn NodeApi>>>) -> Self {
        Self { store, clients }
    }

    fn client(&self, node: &str) -> Result<&Arc<dyn NodeApi>, NodeError> {
        self.clients
            .get(node)
            .ok_or_else(|| NodeError::Permanent(format!("node '{node}' is not configured")))
    }

    /// Resolve a username to its remote id on `target_node`. Mapping cache
    /// first; on miss the target's user list is fetched, all mappings are
    /// repopulated, and the name is matched case-insensitively.
    pub async fn resolve_user(
        &self,
        username: &str,
        target_node: &str,
        now: DateTime<Utc>,
    ) -> Result<String, ResolveError> {
        if let Some(mapping) = self.store.get_user_mapping(username, target_node).await? {
            return Ok(mapping.remote_user_id);
        }

        let client = self.client(target_node)?;
        let users = client.list_users().await?;
        let mut resolved = None;
        for user in &users {
            self.store
                .put_user_mapping(&user.username, target_node, &user.remote_id, now)
                .await?;
            if user.username.eq_ignore_ascii_case(username) {
                resolved = Some(user.remote_id.clone());
            }
        }

        match resolved {
            Some(id) => {
                tracing::debug!(node = target_node, user = username, "Resolved user");
                Ok(id)
            }
            None => Err(ResolveError::NoMatchingUser),
        }
    }

    /// Resolve an item descriptor on `target_node`: path first, then
    /// provider ids in fixed order. `Ok(None)` means the item is absent.
    pub async fn resolve_item(
        &self,
        target_node: &str,
        item: &ItemRef,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, ResolveError> {
        let client = self.client(target_node)?;

        if let Some(path) = item.path.as_deref().filter(|p| !p.is_empty()) {
            let key = format!("path:{path}");
            if let Some(id) = self.cached(target_node, &key, now).await? {
                return Ok(Some(id));
            }
            if let Some(id) = client.find_item_by_path(path).await? {
                self.store
                    .put_item_cache(target_node, &key, &id, Some(&item.name), now)
                    .await?;
                return Ok(Some(id));
            }
        }

        for (provider, value) in item.providers.in_order() {
            let key = format!("{}:{}", provider.as_str(), value);
            if let Some(id) = self.cached(target_node, &key, now).await? {
                return Ok(Some(id));
            }
            if let Some(id) = self.lookup_provider(client, provider, value).await? {
                self.store
                    .put_item_cache(target_node, &key, &id, Some(&item.name), now)
                    .await?;
                return Ok(Some(id));
            }
        }

        Ok(None)
    }

    async fn cached(
        &self,
        node: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<String>> {
        match self.store.get_item_cache(node, key).await? {
            Some(entry) if !entry.is_stale(now) => Ok(Some(entry.remote_item_id)),
            Some(_) => {
                // Stale entries are dropped so the node is consulted again.
                self.store.invalidate_item(node, key).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn lookup_provider(
        &self,
        client: &Arc<dyn NodeApi>,
        provider: Provider,
        value: &str,
    ) -> Result<Option<String>, NodeError> {
        client.find_item_by_provider(provider, value).await
    }

    /// Drop a cached item id that turned out to be gone on the node.
    pub async fn invalidate_item(&self, node: &str, item: &ItemRef) -> AppResult<()> {
        if let Some(key) = item.identity_key() {
            self.store.invalidate_item(node, &key).await?;
        }
        Ok(())
    }
}
