#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::coordinator::SessionCoordinator;
use super::heartbeat::ConnectionTable;
use super::protocol::{ClientMessage, Inbound};
use crate::error::CommandError;
use crate::metrics::{Counter, ServerMetrics};
use crate::rate_limit::RateLimiter;
use crate::room::RoomRegistry;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client. A client that falls this far behind
/// starts losing broadcasts instead of stalling the room.
pub const CHANNEL_CAPACITY: usize = 64;

/// Frames queued for one client's socket.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Pre-serialized JSON envelope, shared across a broadcast
    Text(Arc<String>),
    /// Transport-level heartbeat ping
    Ping,
}

pub type OutboundSender = mpsc::Sender<Outbound>;

/// Everything a connection needs from the server.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: RoomRegistry,
    pub connections: ConnectionTable,
    pub metrics: ServerMetrics,
    pub rate_limit_per_sec: u32,
}

/// Handles a single WebSocket connection
pub async fn handle_connection(socket: WebSocket, ctx: ConnectionContext, _permit: OwnedSemaphorePermit) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", connection_id);

    ctx.metrics.inc(Counter::ConnectionsTotal);
    let _conn_guard = ctx.metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(CHANNEL_CAPACITY);

    let send_metrics = ctx.metrics.clone();
    let send_id = connection_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let frame = match outbound {
                Outbound::Text(json) => {
                    send_metrics.inc(Counter::MessagesSent);
                    Message::Text((*json).clone().into())
                }
                Outbound::Ping => Message::Ping(Bytes::new()),
            };
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
        debug!("Send task finished for connection: {}", send_id);
    });

    let liveness = ctx.connections.register(&connection_id, tx.clone());
    let mut session = SessionCoordinator::new(
        ctx.registry.clone(),
        ctx.metrics.clone(),
        tx.clone(),
        connection_id.clone(),
    );
    let mut limiter = RateLimiter::new(ctx.rate_limit_per_sec, Duration::from_secs(1));
    let mut rate_limit_warned = false;

    loop {
        let frame = tokio::select! {
            frame = ws_receiver.next() => frame,
            _ = liveness.terminated() => {
                warn!("Connection {} missed heartbeats, terminating", connection_id);
                break;
            }
        };

        let msg = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!("WebSocket error on {}: {}", connection_id, e);
                break;
            }
            None => break,
        };
        liveness.mark_alive();

        match msg {
            Message::Text(text) => {
                ctx.metrics.inc(Counter::MessagesReceived);

                if !limiter.check() {
                    ctx.metrics.inc(Counter::RateLimited);
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for connection {}", connection_id);
                    }
                    session.reply_error(&CommandError::RateLimited(limiter.max()));
                    continue;
                }
                rate_limit_warned = false;

                let start = Instant::now();
                match ClientMessage::parse(text.as_str()) {
                    Ok(Inbound::Command(command)) => {
                        let kind = command.type_name();
                        if let Err(e) = session.handle(command).await {
                            debug!("{} from {} rejected: {}", kind, connection_id, e);
                            // Send task has exited
                            if tx.is_closed() {
                                break;
                            }
                            session.reply_error(&e);
                        }
                    }
                    Ok(Inbound::Unknown(kind)) => {
                        warn!("Unknown message type {:?} from {}, ignoring", kind, connection_id);
                    }
                    Err(e) => {
                        warn!("Invalid message from {}: {}", connection_id, e);
                        session.reply_error(&e);
                    }
                }
                ctx.metrics.observe_command_handling(start.elapsed());
            }
            Message::Close(_) => {
                info!("Client {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Control frames only refresh liveness
            }
            Message::Binary(_) => {
                warn!("Binary frame from {}, ignoring", connection_id);
                session.reply_error(&CommandError::InvalidMessage("binary frames are not supported".into()));
            }
        }
    }

    session.disconnect().await;

    // Every sender clone must go before the send task can finish
    drop(liveness);
    drop(session);
    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for: {}", connection_id);
}
