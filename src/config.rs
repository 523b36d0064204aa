//! Application configuration loaded from a YAML file with env overrides.

use std::env;
use std::path::Path;

use serde::Deserialize;

use crate::error::{AppError, Result};

/// Read an environment variable and parse it, falling back to a default on missing or invalid values.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Configuration for a single media node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Unique short identifier, used in webhook URLs and the sync log.
    pub name: String,
    /// Base URL of the node's management API.
    pub url: String,
    /// API key sent in the authorization header.
    pub api_key: String,
    /// Users on this node authenticate without a password.
    #[serde(default)]
    pub passwordless: bool,
}

/// Which kinds of user-state changes are replicated, and worker tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub playback_progress: bool,
    pub watched_status: bool,
    pub favorites: bool,
    pub ratings: bool,
    pub playlists: bool,
    pub progress_debounce_seconds: i64,
    pub worker_interval_seconds: u64,
    pub max_retries: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            playback_progress: true,
            watched_status: true,
            favorites: true,
            ratings: true,
            playlists: true,
            progress_debounce_seconds: 30,
            worker_interval_seconds: 5,
            max_retries: 5,
        }
    }
}

/// Retry policy for items that have not yet been indexed on a target,
/// selected by longest matching path prefix.
#[derive(Debug, Clone, Deserialize)]
pub struct PathSyncPolicy {
    /// Path prefix to match (e.g. `/mnt/nfs/movies`).
    pub prefix: String,
    /// `-1` = retry forever, `0` = fail immediately, `>0` = attempt budget.
    #[serde(default)]
    pub absent_retry_count: i64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: i64,
}

fn default_retry_delay() -> i64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "/data/crosswatch.db".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub servers: Vec<NodeConfig>,
    pub sync: SyncConfig,
    pub path_sync_policy: Vec<PathSyncPolicy>,
    pub database: DatabaseConfig,
    pub server: ServerSettings,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the YAML file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AppError::Config(format!(
                "cannot read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from a YAML string and apply env overrides.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(raw)
            .map_err(|e| AppError::Config(format!("invalid config: {e}")))?;

        if let Ok(db_path) = env::var("DATABASE_PATH") {
            config.database.path = db_path;
        }
        config.server.port = env_parse("PORT", config.server.port);

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.servers.len() < 2 {
            return Err(AppError::Config(
                "at least two servers are required for replication".into(),
            ));
        }
        let mut names: Vec<&str> = self.servers.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.servers.len() {
            return Err(AppError::Config("duplicate server names".into()));
        }
        Ok(())
    }

    /// Get node config by name.
    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// All nodes except the named one (fan-out targets).
    pub fn other_nodes(&self, exclude: &str) -> Vec<&NodeConfig> {
        self.servers.iter().filter(|s| s.name != exclude).collect()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
