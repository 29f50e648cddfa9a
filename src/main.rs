#![forbid(unsafe_code)]

use anyhow::Result;
use std::sync::Arc;
use syncwatch::config::ServerConfig;
use syncwatch::db;
use syncwatch::metrics::ServerMetrics;
use syncwatch::room::RoomRegistry;
use syncwatch::signaling::SignalingServer;
use syncwatch::store::{PgStore, RoomStore};
use syncwatch::time::SystemClock;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syncwatch=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("SyncWatch - Starting server");

    let config = ServerConfig::from_env();
    let metrics = ServerMetrics::new();

    // Connect to database (optional)
    let store = db::connect(config.database_url.as_deref())
        .await?
        .map(|pool| RoomStore::new(Arc::new(PgStore::new(pool)), config.room_ttl));

    let registry = RoomRegistry::new(config.registry(), Arc::new(SystemClock), store, metrics.clone());
    registry.purge_persisted().await;
    let server = SignalingServer::new(registry.clone(), metrics, &config);
    let heartbeat = server.start_heartbeat(config.heartbeat());

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("Starting signaling server on port {}", config.port);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down...");
    };

    let result = server.serve_with_shutdown(listener, shutdown).await;
    heartbeat.cancel();
    registry.shutdown().await;

    if let Err(e) = &result {
        tracing::error!("Signaling server error: {}", e);
    }
    info!("Server shutdown complete");
    result
}
