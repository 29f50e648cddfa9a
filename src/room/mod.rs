#![forbid(unsafe_code)]

pub mod settings;

use crate::error::{CommandError, CommandResult};
use crate::metrics::{Counter, ServerMetrics};
use crate::playback::{MediaInfo, PlaybackState};
use crate::schedule::{ScheduledTask, TaskSlots};
use crate::signaling::connection::{Outbound, OutboundSender};
use crate::signaling::protocol::{
    ParticipantInfo, PlaybackStatePayload, RoomInfo, RoomStatePayload, ServerMessage,
};
use crate::store::{RoomSnapshot, RoomStore};
use crate::time::Clock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use settings::RoomSettings;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, error, info, warn};

pub const ROOM_ID_LENGTH: usize = 8;
const ROOM_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

pub type SharedRoom = Arc<TokioRwLock<Room>>;

/// Voice chat sub-state; the audio itself never touches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceState {
    pub enabled: bool,
    pub muted: bool,
}

impl Default for VoiceState {
    /// Voice off, muted until the user opts in.
    fn default() -> Self {
        Self {
            enabled: false,
            muted: true,
        }
    }
}

/// Room member bound to one live connection.
#[derive(Clone)]
pub struct Participant {
    pub id: String,
    pub nickname: String,
    pub is_host: bool,
    pub joined_at: i64,
    pub last_seen: i64,
    pub voice: VoiceState,
    pub sender: OutboundSender,
}

impl Participant {
    pub fn new(id: String, nickname: String, sender: OutboundSender, now: i64) -> Self {
        Self {
            id,
            nickname,
            is_host: false,
            joined_at: now,
            last_seen: now,
            voice: VoiceState::default(),
            sender,
        }
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            nickname: self.nickname.clone(),
            is_host: self.is_host,
            joined_at: self.joined_at,
            last_seen: self.last_seen,
            voice: self.voice,
        }
    }
}

/// Room state. Always accessed through its own lock.
pub struct Room {
    pub id: String,
    pub created_at: i64,
    pub host_id: String,
    pub media: Option<MediaInfo>,
    pub playback: PlaybackState,
    pub participants: HashMap<String, Participant>,
    pub settings: RoomSettings,
    clock: Arc<dyn Clock>,
}

impl Room {
    fn new(id: String, host_id: String, settings: RoomSettings, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            id,
            created_at: now,
            host_id,
            media: None,
            playback: PlaybackState::new(now),
            participants: HashMap::new(),
            settings,
            clock,
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn is_host(&self, participant_id: &str) -> bool {
        self.host_id == participant_id
            && self.participants.get(participant_id).is_some_and(|p| p.is_host)
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.settings.max_participants
    }

    /// Known media duration in seconds.
    pub fn duration(&self) -> Option<f64> {
        self.media.as_ref().and_then(|m| m.duration)
    }

    /// Members ordered by join time, ties broken by id.
    pub fn participant_infos(&self) -> Vec<ParticipantInfo> {
        let mut infos: Vec<ParticipantInfo> = self.participants.values().map(Participant::info).collect();
        infos.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    /// Member that inherits host status: the longest-present one.
    pub fn successor(&self) -> Option<String> {
        self.participants
            .values()
            .min_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)))
            .map(|p| p.id.clone())
    }

    /// Moves host status to `new_host_id`. Returns `false` if that id is not a member.
    fn set_host(&mut self, new_host_id: &str) -> bool {
        if !self.participants.contains_key(new_host_id) {
            return false;
        }
        for participant in self.participants.values_mut() {
            participant.is_host = participant.id == new_host_id;
        }
        self.host_id = new_host_id.to_string();
        true
    }

    pub fn playback_payload(&self) -> PlaybackStatePayload {
        PlaybackStatePayload {
            state: self.playback,
            media_url: self.media.as_ref().map(|m| m.source.clone()),
            media_type: self.media.as_ref().map(|m| m.media_type),
            duration: self.duration(),
        }
    }

    pub fn state_message(&self) -> ServerMessage {
        ServerMessage::RoomState(RoomStatePayload {
            room: RoomInfo {
                room_id: self.id.clone(),
                created_at: self.created_at,
                host_id: self.host_id.clone(),
            },
            participants: self.participant_infos(),
            playback_state: self.playback_payload(),
        })
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            id: self.id.clone(),
            created_at: self.created_at,
            host_id: self.host_id.clone(),
            media: self.media.clone(),
            playback_state: self.playback,
            participants: self
                .participants
                .iter()
                .map(|(id, p)| (id.clone(), p.info()))
                .collect(),
            settings: self.settings.clone(),
        }
    }

    fn encode(&self, message: &ServerMessage) -> Option<Arc<String>> {
        match message.encode(self.now()) {
            Ok(json) => Some(Arc::new(json)),
            Err(e) => {
                warn!("Failed to serialize {} for room {}: {}", message.type_name(), self.id, e);
                None
            }
        }
    }

    fn deliver(&self, participant: &Participant, json: Arc<String>) -> bool {
        match participant.sender.try_send(Outbound::Text(json)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Channel full for participant {} in room {}, dropping message", participant.id, self.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel closed for participant {} in room {} (disconnected)", participant.id, self.id);
                false
            }
        }
    }

    pub fn broadcast_all(&self, message: &ServerMessage) {
        if let Some(json) = self.encode(message) {
            for participant in self.participants.values() {
                self.deliver(participant, json.clone());
            }
        }
    }

    pub fn broadcast_except(&self, excluded_id: &str, message: &ServerMessage) {
        if let Some(json) = self.encode(message) {
            for participant in self.participants.values().filter(|p| p.id != excluded_id) {
                self.deliver(participant, json.clone());
            }
        }
    }

    /// Returns whether the message was queued for `participant_id`.
    pub fn send_to(&self, participant_id: &str, message: &ServerMessage) -> bool {
        let Some(participant) = self.participants.get(participant_id) else {
            return false;
        };
        match self.encode(message) {
            Some(json) => self.deliver(participant, json),
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long an empty room lingers before deletion
    pub cleanup_delay: Duration,
    pub default_max_participants: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cleanup_delay: Duration::from_secs(300),
            default_max_participants: settings::DEFAULT_MAX_PARTICIPANTS,
        }
    }
}

/// What `remove_participant` took out of a room.
#[derive(Clone)]
pub struct Departure {
    pub participant: ParticipantInfo,
    pub room: SharedRoom,
    pub room_empty: bool,
}

enum PersistOp {
    Save(RoomSnapshot),
    Remove(String),
    /// Refreshes the stored TTL without rewriting the snapshot
    Touch(String),
    /// Acknowledged once everything queued before it has been applied
    Flush(oneshot::Sender<()>),
}

/// Applies snapshot writes in submission order, off the command path.
fn spawn_persistence_writer(store: RoomStore) -> mpsc::UnboundedSender<PersistOp> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            match op {
                PersistOp::Save(snapshot) => {
                    if let Err(e) = store.save(&snapshot).await {
                        error!("Failed to persist room {}: {}", snapshot.id, e);
                    }
                }
                PersistOp::Remove(room_id) => {
                    if let Err(e) = store.remove(&room_id).await {
                        error!("Failed to remove persisted room {}: {}", room_id, e);
                    }
                }
                PersistOp::Touch(room_id) => match store.touch(&room_id).await {
                    Ok(true) => {}
                    Ok(false) => debug!("No persisted snapshot to refresh for room {}", room_id),
                    Err(e) => warn!("Failed to refresh TTL of room {}: {}", room_id, e),
                },
                PersistOp::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Persistence writer stopped");
    });
    tx
}

/// Owns every live room.
///
/// The outer map sits behind a std RwLock held only for lookups and inserts,
/// never across an await. Each room has its own tokio RwLock, so traffic in
/// one room never waits on another.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<StdRwLock<HashMap<String, SharedRoom>>>,
    cleanup: TaskSlots<String>,
    store: Option<RoomStore>,
    persist_tx: Option<mpsc::UnboundedSender<PersistOp>>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    /// Must be called inside a tokio runtime when `store` is set.
    pub fn new(
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
        store: Option<RoomStore>,
        metrics: ServerMetrics,
    ) -> Self {
        let persist_tx = store.clone().map(spawn_persistence_writer);
        Self {
            rooms: Arc::new(StdRwLock::new(HashMap::new())),
            cleanup: TaskSlots::new(),
            store,
            persist_tx,
            clock,
            config,
            metrics,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn generate_room_id() -> String {
        let mut rng = rand::thread_rng();
        (0..ROOM_ID_LENGTH)
            .map(|_| ROOM_ID_ALPHABET[rng.gen_range(0..ROOM_ID_ALPHABET.len())] as char)
            .collect()
    }

    /// Creates an empty room whose host will be `host_id` once it joins.
    pub fn create_room(&self, host_id: &str, settings: RoomSettings) -> (String, SharedRoom) {
        let (room_id, room) = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            let mut room_id = Self::generate_room_id();
            while rooms.contains_key(&room_id) {
                debug!("Room id collision on {}, regenerating", room_id);
                room_id = Self::generate_room_id();
            }
            let room = Arc::new(TokioRwLock::new(Room::new(
                room_id.clone(),
                host_id.to_string(),
                settings,
                self.clock.clone(),
            )));
            rooms.insert(room_id.clone(), room.clone());
            (room_id, room)
        };

        if let Ok(room) = room.try_read() {
            self.persist(room.snapshot());
        }
        self.metrics.inc(Counter::RoomsCreated);
        info!("Room {} created by {}", room_id, host_id);
        (room_id, room)
    }

    pub fn default_settings(&self) -> RoomSettings {
        RoomSettings::with_capacity(self.config.default_max_participants)
    }

    pub fn get_room(&self, room_id: &str) -> Option<SharedRoom> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    /// Removes the room. Returns whether it existed; deleting twice is a no-op.
    pub fn delete_room(&self, room_id: &str) -> bool {
        self.cleanup.cancel(&room_id.to_string());
        let removed = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.remove(room_id).is_some()
        };
        if removed {
            self.metrics.inc(Counter::RoomsDeleted);
            info!("Room {} deleted", room_id);
            self.enqueue(PersistOp::Remove(room_id.to_string()));
        }
        removed
    }

    /// Inserts `participant`. It becomes host if its id is the room's host id,
    /// or if no current member holds host status (a room rejoined while empty).
    ///
    /// # Errors
    /// `RoomNotFound` if the room is gone, `RoomFull` at capacity.
    pub async fn add_participant(&self, room_id: &str, participant: Participant) -> CommandResult<SharedRoom> {
        let room_lock = self.get_room(room_id).ok_or(CommandError::RoomNotFound)?;
        let (snapshot, promoted) = {
            let mut room = room_lock.write().await;
            // Cleanup may have unregistered the room while we waited for the lock
            if !self.is_registered(room_id, &room_lock) {
                return Err(CommandError::RoomNotFound);
            }
            if room.is_full() {
                return Err(CommandError::RoomFull);
            }
            let takes_host = participant.id == room.host_id || !room.participants.contains_key(&room.host_id);
            let promoted = takes_host && participant.id != room.host_id;
            info!(
                "Participant {} ({}) joined room {}{}",
                participant.id,
                participant.nickname,
                room_id,
                if takes_host { " as host" } else { "" }
            );
            let participant_id = participant.id.clone();
            room.participants.insert(participant_id.clone(), participant);
            if takes_host {
                room.set_host(&participant_id);
            }
            (room.snapshot(), promoted)
        };

        // A join during the empty-room grace period keeps the room alive
        if self.cleanup.cancel(&room_id.to_string()) {
            debug!("Cancelled pending cleanup for room {}", room_id);
        }
        if promoted {
            self.metrics.inc(Counter::HostTransfers);
        }
        self.metrics.inc(Counter::Joins);
        self.persist(snapshot);
        Ok(room_lock)
    }

    fn is_registered(&self, room_id: &str, room_lock: &SharedRoom) -> bool {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).is_some_and(|current| Arc::ptr_eq(current, room_lock))
    }

    /// Removes a member. An emptied room is scheduled for deletion after the
    /// cleanup delay; the deferred check re-verifies emptiness before deleting.
    pub async fn remove_participant(&self, room_id: &str, participant_id: &str) -> Option<Departure> {
        let room_lock = self.get_room(room_id)?;
        let (participant, room_empty, snapshot) = {
            let mut room = room_lock.write().await;
            let participant = room.participants.remove(participant_id)?;
            (participant.info(), room.participants.is_empty(), room.snapshot())
        };

        info!("Participant {} left room {}", participant_id, room_id);
        self.metrics.inc(Counter::Leaves);
        self.persist(snapshot);

        if room_empty {
            self.schedule_cleanup(room_id);
        }

        Some(Departure {
            participant,
            room: room_lock,
            room_empty,
        })
    }

    fn schedule_cleanup(&self, room_id: &str) {
        let registry = self.clone();
        let key = room_id.to_string();
        let delay = self.config.cleanup_delay;
        debug!("Room {} is empty, deleting in {:?} unless someone joins", room_id, delay);

        let task = ScheduledTask::after(delay, {
            let key = key.clone();
            async move {
                registry.cleanup.release(&key);
                registry.delete_if_empty(&key).await;
            }
        });
        self.cleanup.insert(key, task);
    }

    async fn delete_if_empty(&self, room_id: &str) {
        let Some(room_lock) = self.get_room(room_id) else {
            return;
        };
        // Held across the removal so no join can land between check and delete
        let room = room_lock.write().await;
        if room.participants.is_empty() {
            self.delete_room(room_id);
        } else {
            debug!("Room {} regained members, skipping cleanup", room_id);
        }
        drop(room);
    }

    pub fn cleanup_pending(&self, room_id: &str) -> bool {
        self.cleanup.contains(&room_id.to_string())
    }

    /// Moves host status to `new_host_id`.
    /// Fails if the room is absent or the target is not a member.
    pub async fn transfer_host(&self, room_id: &str, new_host_id: &str) -> bool {
        let Some(room_lock) = self.get_room(room_id) else {
            return false;
        };
        let (old_host, snapshot) = {
            let mut room = room_lock.write().await;
            let old_host = room.host_id.clone();
            if !room.set_host(new_host_id) {
                return false;
            }
            (old_host, room.snapshot())
        };

        info!("Host of room {} transferred from {} to {}", room_id, old_host, new_host_id);
        self.metrics.inc(Counter::HostTransfers);
        self.persist(snapshot);
        true
    }

    /// Runs `f` under the room's write lock; a successful result is persisted.
    ///
    /// # Errors
    /// `RoomNotFound` if the room is gone, or whatever `f` rejects with.
    pub async fn mutate<R>(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut Room) -> CommandResult<R>,
    ) -> CommandResult<R> {
        let room_lock = self.get_room(room_id).ok_or(CommandError::RoomNotFound)?;
        let (result, snapshot) = {
            let mut room = room_lock.write().await;
            let result = f(&mut room)?;
            (result, room.snapshot())
        };
        self.persist(snapshot);
        Ok(result)
    }

    /// Runs `f` under the room's read lock.
    ///
    /// # Errors
    /// `RoomNotFound` if the room is gone.
    pub async fn read<R>(&self, room_id: &str, f: impl FnOnce(&Room) -> R) -> CommandResult<R> {
        let room_lock = self.get_room(room_id).ok_or(CommandError::RoomNotFound)?;
        let room = room_lock.read().await;
        Ok(f(&room))
    }

    /// Records activity from a member and refreshes the room's stored TTL.
    pub async fn touch(&self, room_id: &str, participant_id: &str) {
        let Some(room_lock) = self.get_room(room_id) else {
            return;
        };
        let is_member = {
            let mut room = room_lock.write().await;
            let now = room.now();
            match room.participants.get_mut(participant_id) {
                Some(participant) => {
                    participant.last_seen = now;
                    true
                }
                None => false,
            }
        };
        if is_member {
            self.enqueue(PersistOp::Touch(room_id.to_string()));
        }
    }

    /// Removes snapshots left behind by an earlier process. Their connections
    /// are gone, so those rooms cannot be resumed. Returns how many were removed.
    pub async fn purge_persisted(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let room_ids = match store.room_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Failed to list persisted rooms: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for room_id in room_ids {
            if self.get_room(&room_id).is_some() {
                continue;
            }
            match store.remove(&room_id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to purge persisted room {}: {}", room_id, e),
            }
        }
        if removed > 0 {
            info!("Purged {} persisted rooms from a previous run", removed);
        }
        removed
    }

    /// Queues the snapshot for the writer task. Failures are logged there, never returned.
    fn persist(&self, snapshot: RoomSnapshot) {
        self.enqueue(PersistOp::Save(snapshot));
    }

    fn enqueue(&self, op: PersistOp) {
        if let Some(tx) = &self.persist_tx {
            if tx.send(op).is_err() {
                warn!("Persistence writer is gone, dropping room write");
            }
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn total_participant_count(&self) -> usize {
        let room_locks: Vec<SharedRoom> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };

        let mut total = 0;
        for room_lock in room_locks {
            total += room_lock.read().await.participants.len();
        }
        total
    }

    /// `None` when no backing store is configured.
    pub async fn store_available(&self) -> Option<bool> {
        match &self.store {
            Some(store) => Some(store.is_available().await),
            None => None,
        }
    }

    /// Drops every room and pending cleanup. Persisted snapshots are left to expire.
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");
        self.cleanup.cancel_all();

        let all_rooms: Vec<(String, SharedRoom)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };

        for (room_id, room_lock) in &all_rooms {
            let count = room_lock.read().await.participants.len();
            debug!("Shut down room {} ({} participants)", room_id, count);
        }

        info!("All rooms shut down ({} total)", all_rooms.len());
        self.flush_persistence().await;
    }

    /// Waits until every snapshot write queued so far has been applied.
    pub async fn flush_persistence(&self) {
        let Some(tx) = &self.persist_tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(PersistOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}
