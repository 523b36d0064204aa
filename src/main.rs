//! crosswatch - Main Entry Point

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crosswatch::services::supervisor::Supervisor;
use crosswatch::{api, db, Config, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "/config/config.yaml".to_string());
    let config = Config::from_file(&config_path)?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("crosswatch={},tower_http=warn", config.logging.level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(config = %config_path, "Starting crosswatch");
    tracing::info!(
        nodes = ?config.servers.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        "Configured nodes"
    );

    // Open the store
    let pool = db::create_pool(&config.database.path).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!(path = %config.database.path, "Store opened");

    // Start the core: orphan recovery, node probes, sync worker
    let supervisor = Supervisor::start(config.clone(), pool).await?;

    // Build router
    let state = Arc::new(api::AppState::new(config.clone(), &supervisor));
    let app = Router::new()
        .merge(api::routes::create_router(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr: SocketAddr = config.bind_address().parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain the worker and give leased rows back before exiting.
    supervisor.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown signal handler");
    }
}
