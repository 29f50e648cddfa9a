#![forbid(unsafe_code)]

// Key-value persistence for room snapshots

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::playback::{MediaInfo, PlaybackState};
use crate::room::settings::RoomSettings;
use crate::signaling::protocol::ParticipantInfo;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const ROOM_KEY_PREFIX: &str = "syncwatch:room:";
pub const DEFAULT_ROOM_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Minimal key-value contract the room persistence layer needs.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes `value` and (re)starts its time-to-live.
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Live keys starting with `prefix`.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Refreshes the TTL. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn is_available(&self) -> bool;
}

/// Persisted form of a room. Connection handles are never part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub id: String,
    pub created_at: i64,
    pub host_id: String,
    #[serde(default)]
    pub media: Option<MediaInfo>,
    pub playback_state: PlaybackState,
    pub participants: HashMap<String, ParticipantInfo>,
    pub settings: RoomSettings,
}

/// Room snapshots under `syncwatch:room:<id>` with a rolling TTL.
#[derive(Clone)]
pub struct RoomStore {
    backend: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl RoomStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    fn key(room_id: &str) -> String {
        format!("{ROOM_KEY_PREFIX}{room_id}")
    }

    /// Writes the snapshot; every save restarts the TTL.
    pub async fn save(&self, snapshot: &RoomSnapshot) -> StoreResult<()> {
        let value = serde_json::to_string(snapshot)?;
        self.backend.set_ex(&Self::key(&snapshot.id), value, self.ttl).await
    }

    pub async fn load(&self, room_id: &str) -> StoreResult<Option<RoomSnapshot>> {
        match self.backend.get(&Self::key(room_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn remove(&self, room_id: &str) -> StoreResult<()> {
        self.backend.delete(&Self::key(room_id)).await
    }

    pub async fn touch(&self, room_id: &str) -> StoreResult<bool> {
        self.backend.expire(&Self::key(room_id), self.ttl).await
    }

    /// Ids of all persisted rooms.
    pub async fn room_ids(&self) -> StoreResult<Vec<String>> {
        let keys = self.backend.list(ROOM_KEY_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(ROOM_KEY_PREFIX).map(str::to_string))
            .collect())
    }

    pub async fn is_available(&self) -> bool {
        self.backend.is_available().await
    }
}
