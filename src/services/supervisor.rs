//! Process lifecycle: open the store, probe nodes, run the worker,
//! expose readiness state, shut down gracefully.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::services::node_client::{NodeApi, NodeClient};
use crate::services::worker::SyncWorker;
use crate::store::Store;

/// How long shutdown waits for the worker to drain its current batch.
const SHUTDOWN_DRAIN_SECS: u64 = 10;

/// Last observed reachability per node. Probes and the worker write it;
/// readiness reads it.
#[derive(Debug, Default)]
pub struct NodeHealth {
    inner: RwLock<HashMap<String, bool>>,
}

impl NodeHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_sync(&self, node: &str, healthy: bool) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(node.to_string(), healthy);
        }
    }

    pub fn snapshot(&self) -> HashMap<String, bool> {
        self.inner.read().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn any_healthy(&self) -> bool {
        self.inner
            .read()
            .map(|m| m.values().any(|&h| h))
            .unwrap_or(false)
    }
}

/// Running core handed to the HTTP surface and the shutdown path.
pub struct Supervisor {
    pub store: Store,
    pub clients: Arc<HashMap<String, Arc<dyn NodeApi>>>,
    pub node_health: Arc<NodeHealth>,
    pub worker_running: Arc<AtomicBool>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl Supervisor {
    /// Open the store, recover orphaned leases, probe every node, warm the
    /// user-mapping cache, and start the worker.
    pub async fn start(config: Config, pool: SqlitePool) -> Result<Self> {
        let store = Store::new(pool, config.sync.max_retries);
        store.reap_orphans(Utc::now()).await?;

        let mut clients: HashMap<String, Arc<dyn NodeApi>> = HashMap::new();
        for node in &config.servers {
            clients.insert(node.name.clone(), Arc::new(NodeClient::new(node)));
        }
        let clients = Arc::new(clients);

        let node_health = Arc::new(NodeHealth::new());
        for (name, client) in clients.iter() {
            let info = client.health().await;
            node_health.mark_sync(name, info.reachable);
            if info.reachable {
                tracing::info!(
                    node = %name,
                    version = info.version.as_deref().unwrap_or("unknown"),
                    "Node reachable"
                );
            } else {
                tracing::warn!(node = %name, "Node unreachable at startup");
            }
        }

        refresh_user_mappings(&store, &clients, &node_health).await;

        let cancel = CancellationToken::new();
        let worker_running = Arc::new(AtomicBool::new(false));
        let worker = SyncWorker::new(
            config,
            store.clone(),
            clients.clone(),
            node_health.clone(),
            cancel.child_token(),
        );
        let running_flag = worker_running.clone();
        let worker = tokio::spawn(async move {
            running_flag.store(true, Ordering::SeqCst);
            worker.run().await;
            running_flag.store(false, Ordering::SeqCst);
        });

        Ok(Self {
            store,
            clients,
            node_health,
            worker_running,
            cancel,
            worker,
        })
    }

    pub fn worker_running(&self) -> bool {
        self.worker_running.load(Ordering::SeqCst)
    }

    /// Cancel the worker and wait for it to drain. Rows still leased after
    /// the drain window are forced back to pending.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down");
        self.cancel.cancel();
        if tokio::time::timeout(Duration::from_secs(SHUTDOWN_DRAIN_SECS), self.worker)
            .await
            .is_err()
        {
            tracing::warn!("Worker did not drain in time; recovering leased rows");
            if let Err(e) = self.store.reap_orphans(Utc::now()).await {
                tracing::error!(error = %e, "Failed to recover leased rows during shutdown");
            }
        }
    }
}

/// Populate the user-mapping cache from every reachable node so the first
/// events after startup resolve without extra round-trips.
async fn refresh_user_mappings(
    store: &Store,
    clients: &HashMap<String, Arc<dyn NodeApi>>,
    node_health: &NodeHealth,
) {
    let now = Utc::now();
    let healthy = node_health.snapshot();
    let mut total = 0usize;

    for (name, client) in clients {
        if !healthy.get(name).copied().unwrap_or(false) {
            continue;
        }
        match client.list_users().await {
            Ok(users) => {
                for user in &users {
                    if let Err(e) = store
                        .put_user_mapping(&user.username, name, &user.remote_id, now)
                        .await
                    {
                        tracing::warn!(node = %name, error = %e, "Failed to cache user mapping");
                    }
                }
                total += users.len();
            }
            Err(e) => {
                tracing::warn!(node = %name, error = %e, "Failed to list users at startup");
            }
        }
    }

    if total > 0 {
        tracing::info!(count = total, "User mappings refreshed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_health_starts_empty() {
        let health = NodeHealth::new();
        assert!(health.snapshot().is_empty());
        assert!(!health.any_healthy());
    }

    #[test]
    fn test_node_health_marking() {
        let health = NodeHealth::new();
        health.mark_sync("wan", true);
        health.mark_sync("lan", false);
        assert!(health.any_healthy());
        let snapshot = health.snapshot();
        assert_eq!(snapshot.get("wan"), Some(&true));
        assert_eq!(snapshot.get("lan"), Some(&false));
    }

    #[test]
    fn test_node_health_all_down() {
        let health = NodeHealth::new();
        health.mark_sync("wan", false);
        assert!(!health.any_healthy());
    }
}
