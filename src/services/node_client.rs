//! REST client for one media node's management API.
//!
//! Stateless capability wrapper; one instance per configured node. No
//! client-side retries; the worker owns the retry budget so the same
//! policy applies to every operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::models::Provider;

const CONNECT_TIMEOUT_SECS: u64 = 5;
const READ_TIMEOUT_SECS: u64 = 30;
const ITEM_PAGE_SIZE: usize = 500;

/// What was logically absent on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    User,
    Item,
}

impl std::fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Item => write!(f, "item"),
        }
    }
}

/// Failure taxonomy surfaced to the worker; never panics across the
/// worker boundary.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("{kind} not found on node")]
    NotFound { kind: NotFoundKind },

    /// 5xx, connection failures, timeouts. Worth retrying.
    #[error("transient node error: {0}")]
    Transient(String),

    /// Non-404 4xx, schema mismatches. Retrying will not help.
    #[error("permanent node error: {0}")]
    Permanent(String),

    /// Bad or expired api key; degrades node readiness.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl NodeError {
    /// Classify an HTTP status with a short context string.
    pub fn from_status(status: StatusCode, context: &str) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Self::Unauthorized(format!("{context}: {status}"))
            }
            s if s.is_server_error() => Self::Transient(format!("{context}: {s}")),
            s => Self::Permanent(format!("{context}: {s}")),
        }
    }

    /// Connection-level reqwest failures are transient; everything else
    /// (bad URL, decode) is permanent.
    pub fn from_reqwest(err: reqwest::Error, context: &str) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::Transient(format!("{context}: {err}"))
        } else {
            Self::Permanent(format!("{context}: {err}"))
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteUser {
    pub remote_id: String,
    pub username: String,
}

/// User-state of one item on the node, read before apply for
/// last-write-wins comparisons.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserItemData {
    pub played: bool,
    pub position_ticks: i64,
    pub favorite: bool,
    pub rating: Option<f64>,
    pub last_played_at: Option<DateTime<Utc>>,
}

/// Partial user-data mutation; absent fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct UserDataPatch {
    pub played: Option<bool>,
    pub position_ticks: Option<i64>,
    pub favorite: Option<bool>,
    pub rating: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RemotePlaylist {
    pub remote_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct NodeHealthInfo {
    pub reachable: bool,
    pub version: Option<String>,
}

/// Capability surface the core consumes; implemented by [`NodeClient`]
/// over HTTP and by scripted fakes in tests.
#[async_trait]
pub trait NodeApi: Send + Sync {
    fn name(&self) -> &str;

    async fn health(&self) -> NodeHealthInfo;
    async fn list_users(&self) -> Result<Vec<RemoteUser>, NodeError>;

    async fn find_item_by_path(&self, path: &str) -> Result<Option<String>, NodeError>;
    async fn find_item_by_provider(
        &self,
        provider: Provider,
        value: &str,
    ) -> Result<Option<String>, NodeError>;

    async fn get_user_item_data(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> Result<UserItemData, NodeError>;
    async fn apply_user_item_data(
        &self,
        user_id: &str,
        item_id: &str,
        patch: &UserDataPatch,
    ) -> Result<(), NodeError>;

    async fn mark_played(
        &self,
        user_id: &str,
        item_id: &str,
        at_time: DateTime<Utc>,
    ) -> Result<(), NodeError>;
    async fn mark_unplayed(&self, user_id: &str, item_id: &str) -> Result<(), NodeError>;
    async fn set_favorite(
        &self,
        user_id: &str,
        item_id: &str,
        favorite: bool,
    ) -> Result<(), NodeError>;
    async fn set_rating(
        &self,
        user_id: &str,
        item_id: &str,
        rating: Option<f64>,
    ) -> Result<(), NodeError>;
    async fn set_progress(
        &self,
        user_id: &str,
        item_id: &str,
        position_ticks: i64,
    ) -> Result<(), NodeError>;

    async fn create_user(
        &self,
        username: &str,
        password: Option<&str>,
    ) -> Result<String, NodeError>;
    async fn delete_user(&self, remote_id: &str) -> Result<(), NodeError>;

    async fn list_playlists(&self, user_id: &str) -> Result<Vec<RemotePlaylist>, NodeError>;
    async fn create_playlist(&self, user_id: &str, name: &str) -> Result<(), NodeError>;
}

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawUser {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Policy", default)]
    policy: Option<RawUserPolicy>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUserPolicy {
    #[serde(rename = "IsAdministrator", default)]
    is_administrator: bool,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Path", default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawItemPage {
    #[serde(rename = "Items", default)]
    items: Vec<RawItem>,
    #[serde(rename = "TotalRecordCount", default)]
    total_record_count: usize,
}

#[derive(Debug, Deserialize)]
struct RawItemEnvelope {
    #[serde(rename = "UserData", default)]
    user_data: Option<RawUserData>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUserData {
    #[serde(rename = "Played", default)]
    played: bool,
    #[serde(rename = "PlaybackPositionTicks", default)]
    position_ticks: i64,
    #[serde(rename = "IsFavorite", default)]
    favorite: bool,
    #[serde(rename = "Rating", default)]
    rating: Option<f64>,
    #[serde(rename = "LastPlayedDate", default)]
    last_played_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawSystemInfo {
    #[serde(rename = "Version", default)]
    version: Option<String>,
}

// ── HTTP implementation ─────────────────────────────────────────────────

pub struct NodeClient {
    name: String,
    base_url: String,
    client: Client,
    auth_header: String,
    /// Item lookups need a user context with full library access; the
    /// first administrator is used and memoized per process.
    admin_user_id: RwLock<Option<String>>,
}

/// Build the media-server authorization header. A stable device id keeps
/// nodes from listing a new phantom device per restart.
pub(crate) fn auth_header_value(api_key: &str) -> String {
    let device_id = Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"crosswatch.local");
    format!(
        "MediaBrowser Client=\"crosswatch\", Device=\"crosswatch\", DeviceId=\"{}\", Version=\"{}\", Token=\"{}\"",
        device_id,
        env!("CARGO_PKG_VERSION"),
        api_key
    )
}

impl NodeClient {
    pub fn new(config: &NodeConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(std::time::Duration::from_secs(READ_TIMEOUT_SECS))
            .build()
            .expect("failed to build HTTP client");

        Self {
            name: config.name.clone(),
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            auth_header: auth_header_value(&config.api_key),
            admin_user_id: RwLock::new(None),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", &self.auth_header)
    }

    async fn send_ok(&self, builder: RequestBuilder, context: &str) -> Result<reqwest::Response, NodeError> {
        let response = builder
            .send()
            .await
            .map_err(|e| NodeError::from_reqwest(e, context))?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(NodeError::from_status(status, context))
        }
    }

    async fn list_users_raw(&self) -> Result<Vec<RawUser>, NodeError> {
        let response = self
            .send_ok(self.request(Method::GET, "/Users"), "list users")
            .await?;
        response
            .json()
            .await
            .map_err(|e| NodeError::Permanent(format!("list users: {e}")))
    }

    async fn admin_user_id(&self) -> Result<String, NodeError> {
        if let Some(id) = self.admin_user_id.read().await.clone() {
            return Ok(id);
        }
        let users = self.list_users_raw().await?;
        let admin = users
            .iter()
            .find(|u| u.policy.as_ref().is_some_and(|p| p.is_administrator))
            .ok_or_else(|| {
                NodeError::Permanent(format!(
                    "no administrator on node '{}' for item lookups",
                    self.name
                ))
            })?;
        tracing::debug!(
            node = %self.name,
            admin = %admin.name,
            "Using administrator context for item lookups"
        );
        let id = admin.id.clone();
        *self.admin_user_id.write().await = Some(id.clone());
        Ok(id)
    }
}

#[async_trait]
impl NodeApi for NodeClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health(&self) -> NodeHealthInfo {
        match self
            .send_ok(self.request(Method::GET, "/System/Info/Public"), "health")
            .await
        {
            Ok(response) => {
                let version = response
                    .json::<RawSystemInfo>()
                    .await
                    .ok()
                    .and_then(|info| info.version);
                NodeHealthInfo {
                    reachable: true,
                    version,
                }
            }
            Err(e) => {
                tracing::warn!(node = %self.name, error = %e, "Health check failed");
                NodeHealthInfo::default()
            }
        }
    }

    async fn list_users(&self) -> Result<Vec<RemoteUser>, NodeError> {
        let users = self.list_users_raw().await?;
        Ok(users
            .into_iter()
            .map(|u| RemoteUser {
                remote_id: u.id,
                username: u.name,
            })
            .collect())
    }

    /// The node API has no path filter, so the library is paged and
    /// matched locally. Callers cache positive results.
    async fn find_item_by_path(&self, path: &str) -> Result<Option<String>, NodeError> {
        let admin_id = self.admin_user_id().await?;
        let mut start_index = 0usize;

        loop {
            let response = self
                .send_ok(
                    self.request(Method::GET, &format!("/Users/{admin_id}/Items"))
                        .query(&[
                            ("recursive", "true"),
                            ("fields", "Path"),
                            ("includeItemTypes", "Movie,Episode,Video,Audio,MusicVideo"),
                            ("startIndex", &start_index.to_string()),
                            ("limit", &ITEM_PAGE_SIZE.to_string()),
                        ]),
                    "find item by path",
                )
                .await?;
            let page: RawItemPage = response
                .json()
                .await
                .map_err(|e| NodeError::Permanent(format!("find item by path: {e}")))?;

            if let Some(item) = page.items.iter().find(|i| i.path.as_deref() == Some(path)) {
                tracing::debug!(node = %self.name, item = %item.name, "Resolved item by path");
                return Ok(Some(item.id.clone()));
            }

            let fetched = start_index + page.items.len();
            if page.items.is_empty() || fetched >= page.total_record_count {
                return Ok(None);
            }
            start_index = fetched;
        }
    }

    async fn find_item_by_provider(
        &self,
        provider: Provider,
        value: &str,
    ) -> Result<Option<String>, NodeError> {
        let admin_id = self.admin_user_id().await?;
        let provider_param = match provider {
            Provider::Imdb => format!("Imdb.{value}"),
            Provider::Tmdb => format!("Tmdb.{value}"),
            Provider::Tvdb => format!("Tvdb.{value}"),
        };
        let response = self
            .send_ok(
                self.request(Method::GET, &format!("/Users/{admin_id}/Items"))
                    .query(&[
                        ("recursive", "true"),
                        ("fields", "ProviderIds,Path"),
                        // Collections share provider ids with their members.
                        ("excludeItemTypes", "BoxSet,Folder,CollectionFolder"),
                        ("AnyProviderIdEquals", &provider_param),
                        ("limit", "1"),
                    ]),
                "find item by provider",
            )
            .await?;
        let page: RawItemPage = response
            .json()
            .await
            .map_err(|e| NodeError::Permanent(format!("find item by provider: {e}")))?;
        Ok(page.items.into_iter().next().map(|i| i.id))
    }

    async fn get_user_item_data(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> Result<UserItemData, NodeError> {
        let context = "get user item data";
        let response = self
            .request(Method::GET, &format!("/Users/{user_id}/Items/{item_id}"))
            .send()
            .await
            .map_err(|e| NodeError::from_reqwest(e, context))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(NodeError::NotFound {
                kind: NotFoundKind::Item,
            }),
            status if !status.is_success() => Err(NodeError::from_status(status, context)),
            _ => {
                let envelope: RawItemEnvelope = response
                    .json()
                    .await
                    .map_err(|e| NodeError::Permanent(format!("{context}: {e}")))?;
                let data = envelope.user_data.unwrap_or_default();
                Ok(UserItemData {
                    played: data.played,
                    position_ticks: data.position_ticks,
                    favorite: data.favorite,
                    rating: data.rating,
                    last_played_at: data.last_played_at,
                })
            }
        }
    }

    async fn apply_user_item_data(
        &self,
        user_id: &str,
        item_id: &str,
        patch: &UserDataPatch,
    ) -> Result<(), NodeError> {
        let mut body = serde_json::Map::new();
        if let Some(played) = patch.played {
            body.insert("Played".into(), played.into());
        }
        if let Some(ticks) = patch.position_ticks {
            body.insert("PlaybackPositionTicks".into(), ticks.into());
        }
        if let Some(favorite) = patch.favorite {
            body.insert("IsFavorite".into(), favorite.into());
        }
        if let Some(rating) = patch.rating {
            body.insert("Rating".into(), rating.into());
        }
        if body.is_empty() {
            return Ok(());
        }
        self.send_ok(
            self.request(
                Method::POST,
                &format!("/Users/{user_id}/Items/{item_id}/UserData"),
            )
            .json(&body),
            "apply user item data",
        )
        .await?;
        Ok(())
    }

    async fn mark_played(
        &self,
        user_id: &str,
        item_id: &str,
        at_time: DateTime<Utc>,
    ) -> Result<(), NodeError> {
        self.send_ok(
            self.request(
                Method::POST,
                &format!("/Users/{user_id}/PlayedItems/{item_id}"),
            )
            .query(&[("datePlayed", at_time.to_rfc3339())]),
            "mark played",
        )
        .await?;
        Ok(())
    }

    async fn mark_unplayed(&self, user_id: &str, item_id: &str) -> Result<(), NodeError> {
        self.send_ok(
            self.request(
                Method::DELETE,
                &format!("/Users/{user_id}/PlayedItems/{item_id}"),
            ),
            "mark unplayed",
        )
        .await?;
        Ok(())
    }

    async fn set_favorite(
        &self,
        user_id: &str,
        item_id: &str,
        favorite: bool,
    ) -> Result<(), NodeError> {
        let method = if favorite { Method::POST } else { Method::DELETE };
        self.send_ok(
            self.request(
                method,
                &format!("/Users/{user_id}/FavoriteItems/{item_id}"),
            ),
            "set favorite",
        )
        .await?;
        Ok(())
    }

    async fn set_rating(
        &self,
        user_id: &str,
        item_id: &str,
        rating: Option<f64>,
    ) -> Result<(), NodeError> {
        match rating {
            Some(value) => {
                self.apply_user_item_data(
                    user_id,
                    item_id,
                    &UserDataPatch {
                        rating: Some(value),
                        ..Default::default()
                    },
                )
                .await
            }
            None => {
                self.send_ok(
                    self.request(
                        Method::DELETE,
                        &format!("/Users/{user_id}/Items/{item_id}/Rating"),
                    ),
                    "delete rating",
                )
                .await?;
                Ok(())
            }
        }
    }

    /// Writes through the user-data endpoint rather than the playing-items
    /// session endpoint: progress written without an active session must
    /// not fire session events on the target.
    async fn set_progress(
        &self,
        user_id: &str,
        item_id: &str,
        position_ticks: i64,
    ) -> Result<(), NodeError> {
        self.apply_user_item_data(
            user_id,
            item_id,
            &UserDataPatch {
                position_ticks: Some(position_ticks),
                ..Default::default()
            },
        )
        .await
    }

    async fn create_user(
        &self,
        username: &str,
        password: Option<&str>,
    ) -> Result<String, NodeError> {
        let response = self
            .send_ok(
                self.request(Method::POST, "/Users/New").json(&serde_json::json!({
                    "Name": username,
                    "Password": password.unwrap_or(""),
                })),
                "create user",
            )
            .await?;
        let user: RawUser = response
            .json()
            .await
            .map_err(|e| NodeError::Permanent(format!("create user: {e}")))?;
        tracing::info!(node = %self.name, user = %username, "Created user");
        Ok(user.id)
    }

    async fn delete_user(&self, remote_id: &str) -> Result<(), NodeError> {
        let context = "delete user";
        let response = self
            .request(Method::DELETE, &format!("/Users/{remote_id}"))
            .send()
            .await
            .map_err(|e| NodeError::from_reqwest(e, context))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(NodeError::NotFound {
                kind: NotFoundKind::User,
            }),
            status if !status.is_success() => Err(NodeError::from_status(status, context)),
            _ => {
                tracing::info!(node = %self.name, user_id = %remote_id, "Deleted user");
                Ok(())
            }
        }
    }

    async fn list_playlists(&self, user_id: &str) -> Result<Vec<RemotePlaylist>, NodeError> {
        let response = self
            .send_ok(
                self.request(Method::GET, &format!("/Users/{user_id}/Items"))
                    .query(&[("recursive", "true"), ("includeItemTypes", "Playlist")]),
                "list playlists",
            )
            .await?;
        let page: RawItemPage = response
            .json()
            .await
            .map_err(|e| NodeError::Permanent(format!("list playlists: {e}")))?;
        Ok(page
            .items
            .into_iter()
            .map(|i| RemotePlaylist {
                remote_id: i.id,
                name: i.name,
            })
            .collect())
    }

    async fn create_playlist(&self, user_id: &str, name: &str) -> Result<(), NodeError> {
        self.send_ok(
            self.request(Method::POST, "/Playlists")
                .json(&serde_json::json!({
                    "Name": name,
                    "UserId": user_id,
                })),
            "create playlist",
        )
        .await?;
        tracing::info!(node = %self.name, playlist = %name, "Created playlist");
        Ok(())
    }
}
