#![forbid(unsafe_code)]

// Liveness tracking: every connection registers here, a periodic scan pings
// the live ones and terminates the silent ones.

use super::connection::{Outbound, OutboundSender};
use crate::schedule::ScheduledTask;
use crate::time::Clock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering::Relaxed};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Silence longer than this terminates the connection
    pub liveness_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(60),
        }
    }
}

struct ConnectionEntry {
    last_seen: Arc<AtomicI64>,
    sender: OutboundSender,
    terminate: Arc<Notify>,
}

/// Handle a connection keeps while registered. Dropping it unregisters.
pub struct Liveness {
    id: String,
    last_seen: Arc<AtomicI64>,
    terminate: Arc<Notify>,
    table: ConnectionTable,
}

impl Liveness {
    /// Records a liveness signal (any inbound frame, including pongs).
    pub fn mark_alive(&self) {
        self.last_seen.store(self.table.clock.now_millis(), Relaxed);
    }

    /// Resolves once the scanner decides this connection is dead.
    pub async fn terminated(&self) {
        self.terminate.notified().await;
    }
}

impl Drop for Liveness {
    fn drop(&mut self) {
        self.table.unregister(&self.id);
    }
}

/// Shared table of live connections.
#[derive(Clone)]
pub struct ConnectionTable {
    inner: Arc<StdRwLock<HashMap<String, ConnectionEntry>>>,
    clock: Arc<dyn Clock>,
}

impl ConnectionTable {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(StdRwLock::new(HashMap::new())),
            clock,
        }
    }

    pub fn register(&self, id: &str, sender: OutboundSender) -> Liveness {
        let last_seen = Arc::new(AtomicI64::new(self.clock.now_millis()));
        let terminate = Arc::new(Notify::new());
        {
            let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
            map.insert(
                id.to_string(),
                ConnectionEntry {
                    last_seen: last_seen.clone(),
                    sender,
                    terminate: terminate.clone(),
                },
            );
        }
        Liveness {
            id: id.to_string(),
            last_seen,
            terminate,
            table: self.clone(),
        }
    }

    fn unregister(&self, id: &str) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.remove(id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One heartbeat pass. Returns how many connections were terminated.
    pub fn sweep(&self, liveness_timeout: Duration) -> usize {
        let now = self.clock.now_millis();
        let timeout_ms = liveness_timeout.as_millis() as i64;
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());

        let mut terminated = 0;
        for (id, entry) in map.iter() {
            let silent_for = now - entry.last_seen.load(Relaxed);
            if silent_for > timeout_ms {
                info!("Terminating inactive connection {} (silent {} ms)", id, silent_for);
                // notify_one stores a permit, so a reader not yet waiting still sees it
                entry.terminate.notify_one();
                terminated += 1;
            } else {
                match entry.sender.try_send(Outbound::Ping) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("Outbound queue full for {}, skipping heartbeat ping", id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
        terminated
    }

    /// Starts the periodic scan. Dropping or cancelling the task stops it.
    pub fn start(&self, config: HeartbeatConfig) -> ScheduledTask {
        let table = self.clone();
        info!(
            "Heartbeat every {:?}, liveness timeout {:?}",
            config.interval, config.liveness_timeout
        );
        ScheduledTask::every(config.interval, false, move || {
            let table = table.clone();
            let timeout = config.liveness_timeout;
            async move {
                table.sweep(timeout);
            }
        })
    }
}
