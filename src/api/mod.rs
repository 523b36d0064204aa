//! API module - HTTP handlers and shared state.

pub mod handlers;
pub mod openapi;
pub mod routes;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::services::ingest::EventIngestor;
use crate::services::node_client::NodeApi;
use crate::services::supervisor::{NodeHealth, Supervisor};
use crate::store::Store;

/// Application state shared across handlers.
pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub clients: Arc<HashMap<String, Arc<dyn NodeApi>>>,
    pub node_health: Arc<NodeHealth>,
    pub worker_running: Arc<AtomicBool>,
    pub ingestor: EventIngestor,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config, supervisor: &Supervisor) -> Self {
        let ingestor = EventIngestor::new(config.clone(), supervisor.store.clone());
        Self {
            config,
            store: supervisor.store.clone(),
            clients: supervisor.clients.clone(),
            node_health: supervisor.node_health.clone(),
            worker_running: supervisor.worker_running.clone(),
            ingestor,
            started_at: Instant::now(),
        }
    }

    pub fn worker_running(&self) -> bool {
        self.worker_running.load(Ordering::SeqCst)
    }

    /// Probe every node and refresh the shared health map.
    pub async fn probe_nodes(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for (name, client) in self.clients.iter() {
            let reachable = client.health().await.reachable;
            self.node_health.mark_sync(name, reachable);
            results.insert(name.clone(), reachable);
        }
        results
    }
}

pub type SharedState = Arc<AppState>;
