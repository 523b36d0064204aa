//! Common test utilities: in-memory store setup and a scripted node fake.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crosswatch::config::Config;
use crosswatch::models::Provider;
use crosswatch::services::node_client::{
    NodeApi, NodeError, NodeHealthInfo, NotFoundKind, RemotePlaylist, RemoteUser, UserDataPatch,
    UserItemData,
};
use crosswatch::store::Store;

/// Two-node config used by most scenarios.
pub const TWO_NODES: &str = r#"
servers:
  - name: wan
    url: http://wan:8096
    api_key: key-wan
  - name: lan
    url: http://lan:8096
    api_key: key-lan
    passwordless: true
path_sync_policy:
  - prefix: /mnt/nfs/movies
    absent_retry_count: 2
    retry_delay_seconds: 600
"#;

/// Three-node config with a passwordful third node.
pub const THREE_NODES: &str = r#"
servers:
  - name: wan
    url: http://wan:8096
    api_key: key-wan
  - name: lan
    url: http://lan:8096
    api_key: key-lan
    passwordless: true
  - name: attic
    url: http://attic:8096
    api_key: key-attic
"#;

pub fn config(yaml: &str) -> Config {
    Config::from_yaml(yaml).expect("test config")
}

pub async fn memory_store(config: &Config) -> Store {
    let pool = crosswatch::db::create_memory_pool()
        .await
        .expect("memory pool");
    Store::new(pool, config.sync.max_retries)
}

/// Scripted in-memory node. Records every mutating call and lets tests
/// force specific failures.
pub struct FakeNode {
    name: String,
    pub reachable: AtomicBool,
    pub users: Mutex<Vec<RemoteUser>>,
    pub items_by_path: Mutex<HashMap<String, String>>,
    /// Keyed by `provider:value`, e.g. `imdb:tt0133093`.
    pub items_by_provider: Mutex<HashMap<String, String>>,
    pub user_data: Mutex<HashMap<(String, String), UserItemData>>,
    pub playlists: Mutex<HashMap<String, Vec<RemotePlaylist>>>,
    /// Mutating calls in invocation order, rendered as compact strings.
    pub calls: Mutex<Vec<String>>,
    /// When set, every operation fails with a clone of this error.
    pub fail_with: Mutex<Option<NodeError>>,
}

impl FakeNode {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            reachable: AtomicBool::new(true),
            users: Mutex::new(Vec::new()),
            items_by_path: Mutex::new(HashMap::new()),
            items_by_provider: Mutex::new(HashMap::new()),
            user_data: Mutex::new(HashMap::new()),
            playlists: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
        })
    }

    pub fn add_user(&self, remote_id: &str, username: &str) {
        self.users.lock().unwrap().push(RemoteUser {
            remote_id: remote_id.to_string(),
            username: username.to_string(),
        });
    }

    pub fn add_item_by_path(&self, path: &str, remote_id: &str) {
        self.items_by_path
            .lock()
            .unwrap()
            .insert(path.to_string(), remote_id.to_string());
    }

    pub fn add_item_by_provider(&self, provider: &str, value: &str, remote_id: &str) {
        self.items_by_provider
            .lock()
            .unwrap()
            .insert(format!("{provider}:{value}"), remote_id.to_string());
    }

    pub fn set_user_data(&self, user_id: &str, item_id: &str, data: UserItemData) {
        self.user_data
            .lock()
            .unwrap()
            .insert((user_id.to_string(), item_id.to_string()), data);
    }

    pub fn user_data_for(&self, user_id: &str, item_id: &str) -> UserItemData {
        self.user_data
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), item_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_everything(&self, err: NodeError) {
        *self.fail_with.lock().unwrap() = Some(err);
    }

    pub fn heal(&self) {
        *self.fail_with.lock().unwrap() = None;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mutating_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn gate(&self) -> Result<(), NodeError> {
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(())
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl NodeApi for FakeNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health(&self) -> NodeHealthInfo {
        NodeHealthInfo {
            reachable: self.reachable.load(Ordering::SeqCst),
            version: Some("10.9.0".into()),
        }
    }

    async fn list_users(&self) -> Result<Vec<RemoteUser>, NodeError> {
        self.gate()?;
        Ok(self.users.lock().unwrap().clone())
    }

    async fn find_item_by_path(&self, path: &str) -> Result<Option<String>, NodeError> {
        self.gate()?;
        Ok(self.items_by_path.lock().unwrap().get(path).cloned())
    }

    async fn find_item_by_provider(
        &self,
        provider: Provider,
        value: &str,
    ) -> Result<Option<String>, NodeError> {
        self.gate()?;
        let key = format!("{}:{}", provider.as_str(), value);
        Ok(self.items_by_provider.lock().unwrap().get(&key).cloned())
    }

    async fn get_user_item_data(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> Result<UserItemData, NodeError> {
        self.gate()?;
        Ok(self.user_data_for(user_id, item_id))
    }

    async fn apply_user_item_data(
        &self,
        user_id: &str,
        item_id: &str,
        patch: &UserDataPatch,
    ) -> Result<(), NodeError> {
        self.gate()?;
        self.record(format!("apply_user_item_data:{user_id}:{item_id}"));
        let mut data = self.user_data.lock().unwrap();
        let entry = data
            .entry((user_id.to_string(), item_id.to_string()))
            .or_default();
        if let Some(played) = patch.played {
            entry.played = played;
        }
        if let Some(ticks) = patch.position_ticks {
            entry.position_ticks = ticks;
        }
        if let Some(favorite) = patch.favorite {
            entry.favorite = favorite;
        }
        if let Some(rating) = patch.rating {
            entry.rating = Some(rating);
        }
        Ok(())
    }

    async fn mark_played(
        &self,
        user_id: &str,
        item_id: &str,
        at_time: DateTime<Utc>,
    ) -> Result<(), NodeError> {
        self.gate()?;
        self.record(format!("mark_played:{user_id}:{item_id}"));
        let mut data = self.user_data.lock().unwrap();
        let entry = data
            .entry((user_id.to_string(), item_id.to_string()))
            .or_default();
        entry.played = true;
        entry.last_played_at = Some(at_time);
        Ok(())
    }

    async fn mark_unplayed(&self, user_id: &str, item_id: &str) -> Result<(), NodeError> {
        self.gate()?;
        self.record(format!("mark_unplayed:{user_id}:{item_id}"));
        let mut data = self.user_data.lock().unwrap();
        data.entry((user_id.to_string(), item_id.to_string()))
            .or_default()
            .played = false;
        Ok(())
    }

    async fn set_favorite(
        &self,
        user_id: &str,
        item_id: &str,
        favorite: bool,
    ) -> Result<(), NodeError> {
        self.gate()?;
        self.record(format!("set_favorite:{user_id}:{item_id}:{favorite}"));
        let mut data = self.user_data.lock().unwrap();
        data.entry((user_id.to_string(), item_id.to_string()))
            .or_default()
            .favorite = favorite;
        Ok(())
    }

    async fn set_rating(
        &self,
        user_id: &str,
        item_id: &str,
        rating: Option<f64>,
    ) -> Result<(), NodeError> {
        self.gate()?;
        self.record(format!("set_rating:{user_id}:{item_id}:{rating:?}"));
        let mut data = self.user_data.lock().unwrap();
        data.entry((user_id.to_string(), item_id.to_string()))
            .or_default()
            .rating = rating;
        Ok(())
    }

    async fn set_progress(
        &self,
        user_id: &str,
        item_id: &str,
        position_ticks: i64,
    ) -> Result<(), NodeError> {
        self.gate()?;
        self.record(format!("set_progress:{user_id}:{item_id}:{position_ticks}"));
        let mut data = self.user_data.lock().unwrap();
        data.entry((user_id.to_string(), item_id.to_string()))
            .or_default()
            .position_ticks = position_ticks;
        Ok(())
    }

    async fn create_user(
        &self,
        username: &str,
        password: Option<&str>,
    ) -> Result<String, NodeError> {
        self.gate()?;
        let has_password = password.is_some();
        self.record(format!("create_user:{username}:password={has_password}"));
        let remote_id = format!("U-{}-{}", self.name, username.to_lowercase());
        self.users.lock().unwrap().push(RemoteUser {
            remote_id: remote_id.clone(),
            username: username.to_string(),
        });
        Ok(remote_id)
    }

    async fn delete_user(&self, remote_id: &str) -> Result<(), NodeError> {
        self.gate()?;
        self.record(format!("delete_user:{remote_id}"));
        let mut users = self.users.lock().unwrap();
        let before = users.len();
        users.retain(|u| u.remote_id != remote_id);
        if users.len() == before {
            return Err(NodeError::NotFound {
                kind: NotFoundKind::User,
            });
        }
        Ok(())
    }

    async fn list_playlists(&self, user_id: &str) -> Result<Vec<RemotePlaylist>, NodeError> {
        self.gate()?;
        Ok(self
            .playlists
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_playlist(&self, user_id: &str, name: &str) -> Result<(), NodeError> {
        self.gate()?;
        self.record(format!("create_playlist:{user_id}:{name}"));
        self.playlists
            .lock()
            .unwrap()
            .entry(user_id.to_string())
            .or_default()
            .push(RemotePlaylist {
                remote_id: format!("P-{name}"),
                name: name.to_string(),
            });
        Ok(())
    }
}
