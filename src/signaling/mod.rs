#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod coordinator;
pub mod heartbeat;
pub mod protocol;

use crate::config::ServerConfig;
use crate::metrics::ServerMetrics;
use crate::room::RoomRegistry;
use crate::time::unix_millis;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use connection::ConnectionContext;
use heartbeat::{ConnectionTable, HeartbeatConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

pub use coordinator::{SessionCoordinator, SessionState};

const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    registry: RoomRegistry,
    connections: ConnectionTable,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    rate_limit_per_sec: u32,
    metrics_token: Option<String>,
}

impl SignalingServer {
    pub fn new(registry: RoomRegistry, metrics: ServerMetrics, config: &ServerConfig) -> Self {
        info!("Max connections: {}", config.max_connections);
        let connections = ConnectionTable::new(registry.clock().clone());
        Self {
            registry,
            connections,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            rate_limit_per_sec: config.rate_limit_per_sec,
            metrics_token: config.metrics_token.clone(),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    /// Starts the liveness scanner; it stops when the returned task is dropped.
    pub fn start_heartbeat(&self, config: HeartbeatConfig) -> crate::schedule::ScheduledTask {
        self.connections.start(config)
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    ///
    /// # Errors
    /// Returns an error if the server fails while accepting connections
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!("Signaling server listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        self.serve_with_shutdown(listener, std::future::pending()).await
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.registry.room_count();
    let participants = server.registry.total_participant_count().await;
    let storage = match server.registry.store_available().await {
        Some(true) => "connected",
        Some(false) => "unavailable",
        None => "disabled",
    };
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": unix_millis(),
        "rooms": rooms,
        "participants": participants,
        "storage": storage,
    }))
}

/// Prometheus text exposition, behind an optional bearer token.
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = &server.metrics_token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.registry.room_count();
    let participants = server.registry.total_participant_count().await;
    let body = server.metrics.render_prometheus(rooms, participants);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    let ctx = ConnectionContext {
        registry: server.registry,
        connections: server.connections,
        metrics: server.metrics,
        rate_limit_per_sec: server.rate_limit_per_sec,
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| connection::handle_connection(socket, ctx, permit))
}
