#![forbid(unsafe_code)]

// Per-connection session: binds a connection to at most one room and applies its commands

use super::connection::{Outbound, OutboundSender};
use super::protocol::{
    ChatBroadcast, ChatKind, ChatMessagePayload, ClientMessage, CreateRoomPayload, HostChangedPayload,
    JoinRoomPayload, MediaDurationPayload, MediaSetPayload, ParticipantLeftPayload, ParticipantPayload,
    PingPayload, PongPayload, RelayedSignal, RoomCreatedPayload, RoomJoinedPayload, ServerMessage,
    VoiceStatePayload, WebRtcSignalPayload,
};
use crate::error::{CommandError, CommandResult};
use crate::metrics::{Counter, ServerMetrics};
use crate::playback::{MediaInfo, PlaybackState};
use crate::room::settings::{RoomSettings, MAX_PARTICIPANTS_LIMIT};
use crate::room::{Participant, Room, RoomRegistry, VoiceState};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const MAX_CHAT_LENGTH: usize = 1000;
pub const MAX_NICKNAME_LENGTH: usize = 20;
pub const MAX_PASSWORD_LENGTH: usize = 100;
pub const MAX_MEDIA_URL_LENGTH: usize = 2048;
const ROOM_ID_LENGTH_RANGE: std::ops::RangeInclusive<usize> = 6..=12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unbound,
    Bound { room_id: String, participant_id: String },
    Closed,
}

/// Owns one connection's protocol state. Commands are applied one at a time,
/// each to completion, before the next is read.
pub struct SessionCoordinator {
    registry: RoomRegistry,
    metrics: ServerMetrics,
    sender: OutboundSender,
    connection_id: String,
    state: SessionState,
}

impl SessionCoordinator {
    pub fn new(registry: RoomRegistry, metrics: ServerMetrics, sender: OutboundSender, connection_id: String) -> Self {
        Self {
            registry,
            metrics,
            sender,
            connection_id,
            state: SessionState::Unbound,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Participant id this connection uses once bound.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn now(&self) -> i64 {
        self.registry.clock().now_millis()
    }

    /// Queues a message to this connection only.
    pub fn reply(&self, message: &ServerMessage) {
        let json = match message.encode(self.now()) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!("Failed to serialize {} reply: {}", message.type_name(), e);
                return;
            }
        };
        if let Err(e) = self.sender.try_send(Outbound::Text(json)) {
            debug!("Dropping {} reply to {}: {}", message.type_name(), self.connection_id, e);
        }
    }

    pub fn reply_error(&self, error: &CommandError) {
        self.metrics.inc(Counter::Errors);
        self.reply(&error.to_message());
    }

    /// Applies one command. Errors are terminal for this command only.
    pub async fn handle(&mut self, command: ClientMessage) -> CommandResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }

        match command {
            ClientMessage::Ping(p) => {
                self.handle_ping(p);
                Ok(())
            }
            ClientMessage::CreateRoom(p) => self.handle_create_room(p).await,
            ClientMessage::JoinRoom(p) => self.handle_join_room(p).await,
            command => {
                let (room_id, participant_id) = self.bound(command.claimed_room())?;
                self.registry.touch(&room_id, &participant_id).await;
                self.handle_room_command(&room_id, &participant_id, command).await
            }
        }
    }

    /// Current binding, checking any room id the client claimed against it.
    fn bound(&self, claimed_room: Option<&str>) -> CommandResult<(String, String)> {
        match &self.state {
            SessionState::Bound { room_id, participant_id } => {
                if let Some(claimed) = claimed_room {
                    if claimed != room_id {
                        return Err(CommandError::validation("Room ID does not match the joined room"));
                    }
                }
                Ok((room_id.clone(), participant_id.clone()))
            }
            _ => Err(CommandError::validation("Not in a room")),
        }
    }

    fn ensure_unbound(&self) -> CommandResult<()> {
        match self.state {
            SessionState::Unbound => Ok(()),
            _ => Err(CommandError::validation("Already in a room")),
        }
    }

    fn handle_ping(&self, payload: PingPayload) {
        self.reply(&ServerMessage::Pong(PongPayload {
            client_time: payload.client_time,
            server_time: self.now(),
        }));
    }

    async fn handle_create_room(&mut self, payload: CreateRoomPayload) -> CommandResult<()> {
        self.ensure_unbound()?;
        let nickname = validate_nickname(&payload.nickname)?;
        let password = validate_password(payload.password)?;

        let mut settings = match payload.max_participants {
            Some(n) if !(1..=MAX_PARTICIPANTS_LIMIT).contains(&n) => {
                return Err(CommandError::validation(format!(
                    "maxParticipants must be between 1 and {MAX_PARTICIPANTS_LIMIT}"
                )));
            }
            Some(n) => RoomSettings::with_capacity(n),
            None => self.registry.default_settings(),
        };
        if let Some(password) = password {
            settings = hash_password(settings, password).await?;
        }

        let participant_id = self.connection_id.clone();
        let (room_id, _) = self.registry.create_room(&participant_id, settings);
        let host = Participant::new(participant_id.clone(), nickname, self.sender.clone(), self.now());
        if let Err(e) = self.registry.add_participant(&room_id, host).await {
            self.registry.delete_room(&room_id);
            return Err(e);
        }

        self.state = SessionState::Bound {
            room_id: room_id.clone(),
            participant_id: participant_id.clone(),
        };
        self.reply(&ServerMessage::RoomCreated(RoomCreatedPayload {
            room_id: room_id.clone(),
            participant_id,
        }));
        self.send_room_state(&room_id).await
    }

    async fn handle_join_room(&mut self, payload: JoinRoomPayload) -> CommandResult<()> {
        self.ensure_unbound()?;
        let room_id = payload.room_id.trim().to_string();
        if !ROOM_ID_LENGTH_RANGE.contains(&room_id.chars().count()) {
            return Err(CommandError::validation("Room ID must be 6-12 characters"));
        }
        let nickname = validate_nickname(&payload.nickname)?;
        let password = validate_password(payload.password)?;

        let room = self.registry.get_room(&room_id).ok_or(CommandError::RoomNotFound)?;
        let settings = room.read().await.settings.clone();
        if settings.is_private {
            let admitted = tokio::task::spawn_blocking(move || settings.admits(password.as_deref()))
                .await
                .unwrap_or(false);
            if !admitted {
                info!("Rejected join to room {} from {}: bad password", room_id, self.connection_id);
                return Err(CommandError::InvalidPassword);
            }
        }

        let participant_id = self.connection_id.clone();
        let joiner = Participant::new(participant_id.clone(), nickname, self.sender.clone(), self.now());
        let room = self.registry.add_participant(&room_id, joiner).await?;

        self.state = SessionState::Bound {
            room_id: room_id.clone(),
            participant_id: participant_id.clone(),
        };

        let room = room.read().await;
        if let Some(joined) = room.participants.get(&participant_id) {
            room.broadcast_except(
                &participant_id,
                &ServerMessage::ParticipantJoined(ParticipantPayload { participant: joined.info() }),
            );
        }
        room.send_to(
            &participant_id,
            &ServerMessage::RoomJoined(RoomJoinedPayload {
                room_id: room_id.clone(),
                participant_id: participant_id.clone(),
            }),
        );
        room.send_to(&participant_id, &room.state_message());
        // Joining a room nobody was hosting hands the joiner host status
        if room.host_id == participant_id {
            info!("Participant {} took over hostless room {}", participant_id, room_id);
            room.broadcast_all(&ServerMessage::HostChanged(HostChangedPayload {
                new_host_id: participant_id.clone(),
            }));
        }
        Ok(())
    }

    async fn send_room_state(&self, room_id: &str) -> CommandResult<()> {
        let participant_id = self.connection_id.clone();
        self.registry
            .read(room_id, |room| {
                room.send_to(&participant_id, &room.state_message());
            })
            .await
    }

    async fn handle_room_command(&self, room_id: &str, participant_id: &str, command: ClientMessage) -> CommandResult<()> {
        match command {
            ClientMessage::SetMedia(p) => {
                let raw = p.media_url.trim();
                if raw.len() > MAX_MEDIA_URL_LENGTH {
                    return Err(CommandError::validation("Media URL too long"));
                }
                let media = MediaInfo::from_url(raw)
                    .ok_or_else(|| CommandError::validation("Media URL must be an absolute http(s) URL"))?;
                self.host_command(room_id, participant_id, move |room| {
                    let message = ServerMessage::MediaSet(MediaSetPayload {
                        media_url: media.source.clone(),
                        media_type: media.media_type,
                    });
                    room.media = Some(media);
                    room.playback = PlaybackState::new(room.now());
                    room.broadcast_all(&message);
                    Ok(())
                })
                .await?;
                info!("Media set in room {} by {}", room_id, participant_id);
                Ok(())
            }
            ClientMessage::Play(_) => {
                self.host_command(room_id, participant_id, |room| {
                    let now = room.now();
                    let changed = room.playback.play(now);
                    publish_playback(room, participant_id, changed);
                    Ok(())
                })
                .await
            }
            ClientMessage::Pause(_) => {
                self.host_command(room_id, participant_id, |room| {
                    let now = room.now();
                    let duration = room.duration();
                    let changed = room.playback.pause(now, duration);
                    publish_playback(room, participant_id, changed);
                    Ok(())
                })
                .await
            }
            ClientMessage::Seek(p) => {
                let position = finite(p.position, "position")?;
                self.host_command(room_id, participant_id, move |room| {
                    let now = room.now();
                    let duration = room.duration();
                    room.playback.seek(position, duration, now);
                    publish_playback(room, participant_id, true);
                    Ok(())
                })
                .await
            }
            ClientMessage::SetRate(p) => {
                let rate = finite(p.rate, "rate")?;
                self.host_command(room_id, participant_id, move |room| {
                    let now = room.now();
                    let duration = room.duration();
                    room.playback.set_rate(rate, duration, now);
                    publish_playback(room, participant_id, true);
                    Ok(())
                })
                .await
            }
            ClientMessage::MediaDuration(MediaDurationPayload { duration, .. }) => {
                let duration = finite(duration, "duration")?;
                if duration <= 0.0 {
                    return Err(CommandError::validation("duration must be positive"));
                }
                self.host_command(room_id, participant_id, move |room| {
                    let now = room.now();
                    let media = room
                        .media
                        .as_mut()
                        .ok_or_else(|| CommandError::validation("No media set"))?;
                    media.duration = Some(duration);
                    room.playback.clamp_to(Some(duration), now);
                    publish_playback(room, participant_id, true);
                    Ok(())
                })
                .await
            }
            ClientMessage::TransferHost(p) => self.transfer_host(room_id, participant_id, &p.target_id).await,
            ClientMessage::ChatMessage(p) => self.chat(room_id, participant_id, p).await,
            ClientMessage::UpdateNickname(p) => {
                let nickname = validate_nickname(&p.nickname)?;
                self.update_participant(room_id, participant_id, move |participant| {
                    participant.nickname = nickname;
                })
                .await
            }
            ClientMessage::VoiceState(VoiceStatePayload { enabled, muted }) => {
                self.update_participant(room_id, participant_id, move |participant| {
                    participant.voice = VoiceState { enabled, muted };
                })
                .await
            }
            ClientMessage::WebrtcSignal(p) => self.relay_signal(room_id, participant_id, p).await,
            ClientMessage::CreateRoom(_) | ClientMessage::JoinRoom(_) | ClientMessage::Ping(_) => Ok(()),
        }
    }

    /// Runs a playback mutation only if `participant_id` currently holds host status.
    async fn host_command(
        &self,
        room_id: &str,
        participant_id: &str,
        f: impl FnOnce(&mut Room) -> CommandResult<()>,
    ) -> CommandResult<()> {
        self.registry
            .mutate(room_id, |room| {
                if !room.is_host(participant_id) {
                    return Err(CommandError::NotHost);
                }
                f(room)
            })
            .await?;
        self.metrics.inc(Counter::PlaybackCommands);
        Ok(())
    }

    async fn transfer_host(&self, room_id: &str, participant_id: &str, target_id: &str) -> CommandResult<()> {
        let target_present = self
            .registry
            .read(room_id, |room| {
                if !room.is_host(participant_id) {
                    return Err(CommandError::NotHost);
                }
                Ok(room.participants.contains_key(target_id))
            })
            .await??;
        if !target_present {
            return Err(CommandError::ParticipantNotFound);
        }
        if target_id == participant_id {
            return Ok(());
        }

        if !self.registry.transfer_host(room_id, target_id).await {
            return Err(CommandError::ParticipantNotFound);
        }
        self.registry
            .read(room_id, |room| {
                room.broadcast_all(&ServerMessage::HostChanged(HostChangedPayload {
                    new_host_id: target_id.to_string(),
                }));
            })
            .await
    }

    async fn chat(&self, room_id: &str, participant_id: &str, payload: ChatMessagePayload) -> CommandResult<()> {
        let text: String = payload.text.trim().chars().take(MAX_CHAT_LENGTH).collect();
        if text.is_empty() {
            return Ok(());
        }
        let id = Uuid::new_v4().to_string();
        self.registry
            .read(room_id, |room| {
                let nickname = room
                    .participants
                    .get(participant_id)
                    .map_or_else(|| "Anonymous".to_string(), |p| p.nickname.clone());
                room.broadcast_all(&ServerMessage::ChatMessage(ChatBroadcast {
                    id,
                    sender_id: participant_id.to_string(),
                    nickname,
                    text,
                    kind: ChatKind::User,
                    timestamp: room.now(),
                }));
            })
            .await
    }

    async fn update_participant(
        &self,
        room_id: &str,
        participant_id: &str,
        f: impl FnOnce(&mut Participant),
    ) -> CommandResult<()> {
        self.registry
            .mutate(room_id, |room| {
                let participant = room
                    .participants
                    .get_mut(participant_id)
                    .ok_or(CommandError::ParticipantNotFound)?;
                f(participant);
                let info = participant.info();
                room.broadcast_all(&ServerMessage::ParticipantUpdated(ParticipantPayload { participant: info }));
                Ok(())
            })
            .await
    }

    /// Delivers the payload untouched to one member of the same room; unknown targets are dropped.
    async fn relay_signal(&self, room_id: &str, participant_id: &str, payload: WebRtcSignalPayload) -> CommandResult<()> {
        let delivered = self
            .registry
            .read(room_id, |room| {
                room.send_to(
                    &payload.target_id,
                    &ServerMessage::WebrtcSignal(RelayedSignal {
                        sender_id: participant_id.to_string(),
                        signal: payload.signal,
                    }),
                )
            })
            .await?;
        if !delivered {
            debug!("Dropped signal from {} to absent target {} in room {}", participant_id, payload.target_id, room_id);
        }
        Ok(())
    }

    /// Leaves the bound room, handing host status to the longest-present member
    /// when the host leaves. Safe to call more than once.
    pub async fn disconnect(&mut self) {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        let SessionState::Bound { room_id, participant_id } = state else {
            return;
        };

        let Some(departure) = self.registry.remove_participant(&room_id, &participant_id).await else {
            return;
        };

        let mut new_host = None;
        if departure.participant.is_host && !departure.room_empty {
            let successor = departure.room.read().await.successor();
            if let Some(successor) = successor {
                if self.registry.transfer_host(&room_id, &successor).await {
                    new_host = Some(successor);
                } else {
                    error!("Failed to promote {} in room {}", successor, room_id);
                }
            }
        }

        let room = departure.room.read().await;
        if let Some(new_host_id) = new_host {
            room.broadcast_all(&ServerMessage::HostChanged(HostChangedPayload { new_host_id }));
        }
        room.broadcast_all(&ServerMessage::ParticipantLeft(ParticipantLeftPayload {
            od_id: participant_id,
        }));
    }
}

/// Broadcasts the new state, or just echoes it to the issuer when nothing changed.
fn publish_playback(room: &Room, issuer_id: &str, changed: bool) {
    let message = ServerMessage::PlaybackState(room.playback_payload());
    if changed {
        room.broadcast_all(&message);
    } else {
        room.send_to(issuer_id, &message);
    }
}

fn validate_nickname(raw: &str) -> CommandResult<String> {
    let nickname = raw.trim();
    match nickname.chars().count() {
        0 => Err(CommandError::validation("Nickname is required")),
        n if n > MAX_NICKNAME_LENGTH => Err(CommandError::validation("Nickname too long")),
        _ => Ok(nickname.to_string()),
    }
}

/// Empty passwords count as none.
fn validate_password(raw: Option<String>) -> CommandResult<Option<String>> {
    match raw {
        Some(p) if p.chars().count() > MAX_PASSWORD_LENGTH => Err(CommandError::validation("Password too long")),
        Some(p) if p.is_empty() => Ok(None),
        other => Ok(other),
    }
}

fn finite(value: f64, field: &str) -> CommandResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CommandError::validation(format!("{field} must be a finite number")))
    }
}

/// Argon2 is CPU-bound; keep it off the async workers.
async fn hash_password(settings: RoomSettings, password: String) -> CommandResult<RoomSettings> {
    let hashed = tokio::task::spawn_blocking(move || settings.with_password(&password)).await;
    match hashed {
        Ok(Ok(settings)) => Ok(settings),
        Ok(Err(e)) => {
            error!("Failed to hash room password: {}", e);
            Err(CommandError::validation("Could not set room password"))
        }
        Err(e) => {
            error!("Password hashing task failed: {}", e);
            Err(CommandError::validation("Could not set room password"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::RegistryConfig;
    use crate::signaling::protocol::{Inbound, PingPayload, RoomRef, SeekPayload, SetMediaPayload, SetRatePayload, TransferHostPayload};
    use crate::time::ManualClock;
    use serde_json::Value;
    use tokio::sync::mpsc;

    struct Harness {
        registry: RoomRegistry,
        clock: ManualClock,
        metrics: ServerMetrics,
    }

    struct Client {
        session: SessionCoordinator,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = ManualClock::new(1_000_000);
            let metrics = ServerMetrics::new();
            let registry = RoomRegistry::new(RegistryConfig::default(), Arc::new(clock.clone()), None, metrics.clone());
            Self { registry, clock, metrics }
        }

        fn client(&self, id: &str) -> Client {
            let (tx, rx) = mpsc::channel(64);
            Client {
                session: SessionCoordinator::new(self.registry.clone(), self.metrics.clone(), tx, id.to_string()),
                rx,
            }
        }
    }

    impl Client {
        async fn send(&mut self, text: &str) -> CommandResult<()> {
            match ClientMessage::parse(text)? {
                Inbound::Command(cmd) => self.session.handle(cmd).await,
                Inbound::Unknown(_) => Ok(()),
            }
        }

        fn drain(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                if let Outbound::Text(json) = msg {
                    out.push(serde_json::from_str(&json).unwrap());
                }
            }
            out
        }

        fn room_id(&self) -> String {
            match self.session.state() {
                SessionState::Bound { room_id, .. } => room_id.clone(),
                other => panic!("not bound: {other:?}"),
            }
        }
    }

    fn types(messages: &[Value]) -> Vec<&str> {
        messages.iter().map(|m| m["type"].as_str().unwrap()).collect()
    }

    async fn room_with_guest(h: &Harness) -> (Client, Client, String) {
        let mut host = h.client("host");
        host.send(r#"{"type":"create_room","payload":{"nickname":"Host"}}"#).await.unwrap();
        let room_id = host.room_id();
        let mut guest = h.client("guest");
        guest
            .send(&format!(r#"{{"type":"join_room","payload":{{"roomId":"{room_id}","nickname":"Guest"}}}}"#))
            .await
            .unwrap();
        host.drain();
        guest.drain();
        (host, guest, room_id)
    }

    #[tokio::test]
    async fn test_create_room_replies_in_order() {
        let h = Harness::new();
        let mut host = h.client("host");
        host.send(r#"{"type":"create_room","payload":{"nickname":"  Host  "}}"#).await.unwrap();

        let messages = host.drain();
        assert_eq!(types(&messages), vec!["room_created", "room_state"]);
        assert_eq!(messages[0]["payload"]["participantId"], "host");
        assert_eq!(messages[0]["timestamp"], 1_000_000);
        let state = &messages[1]["payload"];
        assert_eq!(state["room"]["hostId"], "host");
        assert_eq!(state["participants"][0]["nickname"], "Host");
        assert_eq!(state["participants"][0]["isHost"], true);
        assert_eq!(state["playbackState"]["isPlaying"], false);
        assert_eq!(state["playbackState"]["rate"], 1.0);
    }

    #[tokio::test]
    async fn test_join_flow_and_errors() {
        let h = Harness::new();
        let (mut host, _guest, room_id) = room_with_guest(&h).await;
        assert_eq!(host.drain().len(), 0);

        let mut late = h.client("late");
        late.send(&format!(r#"{{"type":"join_room","payload":{{"roomId":"{room_id}","nickname":"Late"}}}}"#))
            .await
            .unwrap();
        assert_eq!(types(&late.drain()), vec!["room_joined", "room_state"]);
        let joined = host.drain();
        assert_eq!(types(&joined), vec!["participant_joined"]);
        assert_eq!(joined[0]["payload"]["participant"]["id"], "late");

        let mut lost = h.client("lost");
        let err = lost
            .send(r#"{"type":"join_room","payload":{"roomId":"zzzzzzzz","nickname":"Lost"}}"#)
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::RoomNotFound);
        assert_eq!(lost.session.state(), &SessionState::Unbound);

        let err = lost
            .send(r#"{"type":"join_room","payload":{"roomId":"abc","nickname":"Lost"}}"#)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_private_room_password() {
        let h = Harness::new();
        let mut host = h.client("host");
        host.send(r#"{"type":"create_room","payload":{"nickname":"Host","password":"s3cret"}}"#)
            .await
            .unwrap();
        let room_id = host.room_id();

        let mut wrong = h.client("wrong");
        let err = wrong
            .send(&format!(r#"{{"type":"join_room","payload":{{"roomId":"{room_id}","nickname":"W","password":"nope"}}}}"#))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::InvalidPassword);

        let mut none = h.client("none");
        let err = none
            .send(&format!(r#"{{"type":"join_room","payload":{{"roomId":"{room_id}","nickname":"N"}}}}"#))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::InvalidPassword);

        let mut right = h.client("right");
        right
            .send(&format!(r#"{{"type":"join_room","payload":{{"roomId":"{room_id}","nickname":"R","password":"s3cret"}}}}"#))
            .await
            .unwrap();
        assert_eq!(h.registry.total_participant_count().await, 2);
    }

    #[tokio::test]
    async fn test_capacity_one_rejects_second_join() {
        let h = Harness::new();
        let mut host = h.client("host");
        host.send(r#"{"type":"create_room","payload":{"nickname":"Host","maxParticipants":1}}"#)
            .await
            .unwrap();
        let room_id = host.room_id();

        let mut guest = h.client("guest");
        let err = guest
            .send(&format!(r#"{{"type":"join_room","payload":{{"roomId":"{room_id}","nickname":"G"}}}}"#))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::RoomFull);
        assert_eq!(guest.session.state(), &SessionState::Unbound);
        assert_eq!(h.registry.total_participant_count().await, 1);

        let err = h
            .client("x")
            .send(r#"{"type":"create_room","payload":{"nickname":"X","maxParticipants":0}}"#)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_host_only_commands() {
        let h = Harness::new();
        let (_host, mut guest, room_id) = room_with_guest(&h).await;
        let before = h.registry.read(&room_id, |room| room.playback).await.unwrap();

        let commands = [
            r#"{"type":"play","payload":{}}"#,
            r#"{"type":"pause","payload":{}}"#,
            r#"{"type":"seek","payload":{"position":42}}"#,
            r#"{"type":"set_rate","payload":{"rate":1.5}}"#,
            r#"{"type":"set_media","payload":{"mediaUrl":"https://youtube.com/watch?v=X"}}"#,
            r#"{"type":"media_duration","payload":{"duration":100}}"#,
            r#"{"type":"transfer_host","payload":{"targetId":"guest"}}"#,
        ];
        for command in commands {
            assert_eq!(guest.send(command).await.unwrap_err(), CommandError::NotHost, "{command}");
        }

        let (after, media, host_id) = h
            .registry
            .read(&room_id, |room| (room.playback, room.media.clone(), room.host_id.clone()))
            .await
            .unwrap();
        assert_eq!(after, before);
        assert!(media.is_none());
        assert_eq!(host_id, "host");
    }

    #[tokio::test]
    async fn test_unbound_and_mismatched_room() {
        let h = Harness::new();
        let mut loner = h.client("loner");
        let err = loner.send(r#"{"type":"play"}"#).await.unwrap_err();
        assert_eq!(err, CommandError::validation("Not in a room"));

        let (mut host, _guest, _room_id) = room_with_guest(&h).await;
        let err = host.send(r#"{"type":"play","payload":{"roomId":"otherroom"}}"#).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let err = host.send(r#"{"type":"create_room","payload":{"nickname":"Again"}}"#).await.unwrap_err();
        assert_eq!(err, CommandError::validation("Already in a room"));
    }

    #[tokio::test]
    async fn test_end_to_end_playback() {
        let h = Harness::new();
        let (mut host, mut guest, room_id) = room_with_guest(&h).await;

        host.send(&format!(
            r#"{{"type":"set_media","payload":{{"roomId":"{room_id}","mediaUrl":"https://youtube.com/watch?v=X"}}}}"#
        ))
        .await
        .unwrap();
        for messages in [host.drain(), guest.drain()] {
            assert_eq!(types(&messages), vec!["media_set"]);
            assert_eq!(messages[0]["payload"]["mediaUrl"], "https://youtube.com/watch?v=X");
            assert_eq!(messages[0]["payload"]["mediaType"], "youtube");
        }

        host.send(r#"{"type":"play","payload":{}}"#).await.unwrap();
        for messages in [host.drain(), guest.drain()] {
            assert_eq!(messages[0]["payload"]["isPlaying"], true);
            assert_eq!(messages[0]["payload"]["mediaType"], "youtube");
        }

        h.clock.advance(10_000);
        host.send(r#"{"type":"pause","payload":{}}"#).await.unwrap();
        for messages in [host.drain(), guest.drain()] {
            let payload = &messages[0]["payload"];
            assert_eq!(payload["isPlaying"], false);
            assert!((payload["offset"].as_f64().unwrap() - 10.0).abs() < 1e-9);
        }

        // Repeated pause is a no-op echoed only to the host
        host.send(r#"{"type":"pause","payload":{}}"#).await.unwrap();
        assert_eq!(host.drain().len(), 1);
        assert!(guest.drain().is_empty());
    }

    #[tokio::test]
    async fn test_seek_rate_and_duration_clamps() {
        let h = Harness::new();
        let (mut host, _guest, room_id) = room_with_guest(&h).await;
        host.session
            .handle(ClientMessage::SetMedia(SetMediaPayload {
                room_id: None,
                media_url: "https://cdn.example.com/film.mp4".into(),
            }))
            .await
            .unwrap();

        host.session
            .handle(ClientMessage::Seek(SeekPayload { room_id: None, position: 5_000.0 }))
            .await
            .unwrap();
        let offset = h.registry.read(&room_id, |r| r.playback.offset).await.unwrap();
        assert_eq!(offset, 5_000.0);

        host.send(r#"{"type":"media_duration","payload":{"duration":120}}"#).await.unwrap();
        let offset = h.registry.read(&room_id, |r| r.playback.offset).await.unwrap();
        assert_eq!(offset, 120.0);

        host.session
            .handle(ClientMessage::Seek(SeekPayload { room_id: None, position: -3.0 }))
            .await
            .unwrap();
        assert_eq!(h.registry.read(&room_id, |r| r.playback.offset).await.unwrap(), 0.0);

        host.session
            .handle(ClientMessage::SetRate(SetRatePayload { room_id: None, rate: 0.1 }))
            .await
            .unwrap();
        assert_eq!(h.registry.read(&room_id, |r| r.playback.rate).await.unwrap(), 0.5);
        host.session
            .handle(ClientMessage::SetRate(SetRatePayload { room_id: None, rate: 3.0 }))
            .await
            .unwrap();
        assert_eq!(h.registry.read(&room_id, |r| r.playback.rate).await.unwrap(), 2.0);

        let err = host.send(r#"{"type":"set_media","payload":{"mediaUrl":"file:///etc/passwd"}}"#).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_media_duration_requires_media() {
        let h = Harness::new();
        let (mut host, _guest, _room_id) = room_with_guest(&h).await;
        let err = host.send(r#"{"type":"media_duration","payload":{"duration":60}}"#).await.unwrap_err();
        assert_eq!(err, CommandError::validation("No media set"));
    }

    #[tokio::test]
    async fn test_transfer_host() {
        let h = Harness::new();
        let (mut host, mut guest, room_id) = room_with_guest(&h).await;

        let err = host
            .session
            .handle(ClientMessage::TransferHost(TransferHostPayload { target_id: "ghost".into() }))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::ParticipantNotFound);
        assert_eq!(err.code(), "ROOM_NOT_FOUND");

        host.send(r#"{"type":"transfer_host","payload":{"targetId":"guest"}}"#).await.unwrap();
        for messages in [host.drain(), guest.drain()] {
            assert_eq!(types(&messages), vec!["host_changed"]);
            assert_eq!(messages[0]["payload"]["newHostId"], "guest");
        }

        assert_eq!(host.send(r#"{"type":"play"}"#).await.unwrap_err(), CommandError::NotHost);
        guest.send(r#"{"type":"play"}"#).await.unwrap();
        assert!(h.registry.read(&room_id, |r| r.playback.is_playing).await.unwrap());
    }

    #[tokio::test]
    async fn test_chat_is_trimmed_and_truncated() {
        let h = Harness::new();
        let (mut host, mut guest, _room_id) = room_with_guest(&h).await;

        guest.send(r#"{"type":"chat_message","payload":{"text":"   "}}"#).await.unwrap();
        assert!(host.drain().is_empty());

        let long = "x".repeat(1_500);
        guest
            .send(&format!(r#"{{"type":"chat_message","payload":{{"text":"  {long}  "}}}}"#))
            .await
            .unwrap();
        let messages = host.drain();
        let payload = &messages[0]["payload"];
        assert_eq!(payload["text"].as_str().unwrap().len(), MAX_CHAT_LENGTH);
        assert_eq!(payload["senderId"], "guest");
        assert_eq!(payload["nickname"], "Guest");
        assert_eq!(payload["type"], "user");
        assert!(!payload["id"].as_str().unwrap().is_empty());
        assert_eq!(types(&guest.drain()), vec!["chat_message"]);
    }

    #[tokio::test]
    async fn test_signal_relay_is_targeted() {
        let h = Harness::new();
        let (mut host, mut guest, _room_id) = room_with_guest(&h).await;
        let mut outsider = h.client("outsider");
        outsider.send(r#"{"type":"create_room","payload":{"nickname":"Out"}}"#).await.unwrap();
        outsider.drain();

        host.send(r#"{"type":"webrtc_signal","payload":{"targetId":"guest","signal":{"sdp":"offer","n":[1]}}}"#)
            .await
            .unwrap();
        let messages = guest.drain();
        assert_eq!(types(&messages), vec!["webrtc_signal"]);
        assert_eq!(messages[0]["payload"]["senderId"], "host");
        assert_eq!(messages[0]["payload"]["signal"]["sdp"], "offer");
        assert!(host.drain().is_empty());

        // Other rooms and unknown ids are silently dropped
        host.send(r#"{"type":"webrtc_signal","payload":{"targetId":"outsider","signal":{}}}"#).await.unwrap();
        host.send(r#"{"type":"webrtc_signal","payload":{"targetId":"nobody","signal":{}}}"#).await.unwrap();
        assert!(outsider.drain().is_empty());
    }

    #[tokio::test]
    async fn test_nickname_and_voice_updates() {
        let h = Harness::new();
        let (mut host, mut guest, _room_id) = room_with_guest(&h).await;

        guest.send(r#"{"type":"update_nickname","payload":{"nickname":"Renamed"}}"#).await.unwrap();
        let messages = host.drain();
        assert_eq!(types(&messages), vec!["participant_updated"]);
        assert_eq!(messages[0]["payload"]["participant"]["nickname"], "Renamed");

        guest.send(r#"{"type":"voice_state","payload":{"enabled":true,"muted":false}}"#).await.unwrap();
        let messages = host.drain();
        assert_eq!(messages[0]["payload"]["participant"]["voice"]["enabled"], true);
        assert_eq!(messages[0]["payload"]["participant"]["voice"]["muted"], false);

        let err = guest
            .send(r#"{"type":"update_nickname","payload":{"nickname":"this nickname is far too long"}}"#)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_ping_needs_no_room() {
        let h = Harness::new();
        let mut client = h.client("c");
        client.session.handle(ClientMessage::Ping(PingPayload { client_time: 123.5 })).await.unwrap();
        let messages = client.drain();
        assert_eq!(types(&messages), vec!["pong"]);
        assert_eq!(messages[0]["payload"]["clientTime"], 123.5);
        assert_eq!(messages[0]["payload"]["serverTime"], 1_000_000);
    }

    #[tokio::test]
    async fn test_host_disconnect_promotes_remaining() {
        let h = Harness::new();
        let (mut host, mut guest, room_id) = room_with_guest(&h).await;

        host.session.disconnect().await;
        assert_eq!(host.session.state(), &SessionState::Closed);

        let messages = guest.drain();
        assert_eq!(types(&messages), vec!["host_changed", "participant_left"]);
        assert_eq!(messages[0]["payload"]["newHostId"], "guest");
        assert_eq!(messages[1]["payload"]["odId"], "host");

        let (host_id, is_host) = h
            .registry
            .read(&room_id, |r| (r.host_id.clone(), r.participants["guest"].is_host))
            .await
            .unwrap();
        assert_eq!(host_id, "guest");
        assert!(is_host);

        // Idempotent, and a closed session ignores commands
        host.session.disconnect().await;
        host.session.handle(ClientMessage::Play(RoomRef::default())).await.unwrap();
        assert!(guest.drain().is_empty());
    }

    #[tokio::test]
    async fn test_join_emptied_room_becomes_host() {
        let h = Harness::new();
        let mut host = h.client("host");
        host.send(r#"{"type":"create_room","payload":{"nickname":"Host"}}"#).await.unwrap();
        let room_id = host.room_id();
        host.session.disconnect().await;

        let mut guest = h.client("guest");
        guest
            .send(&format!(r#"{{"type":"join_room","payload":{{"roomId":"{room_id}","nickname":"Guest"}}}}"#))
            .await
            .unwrap();
        let messages = guest.drain();
        assert_eq!(types(&messages), vec!["room_joined", "room_state", "host_changed"]);
        assert_eq!(messages[1]["payload"]["room"]["hostId"], "guest");
        assert_eq!(messages[2]["payload"]["newHostId"], "guest");

        guest.send(r#"{"type":"play","payload":{}}"#).await.unwrap();
        let messages = guest.drain();
        assert_eq!(types(&messages), vec!["playback_state"]);
        assert_eq!(messages[0]["payload"]["isPlaying"], true);

        let mut late = h.client("late");
        late.send(&format!(r#"{{"type":"join_room","payload":{{"roomId":"{room_id}","nickname":"Late"}}}}"#))
            .await
            .unwrap();
        assert_eq!(types(&late.drain()), vec!["room_joined", "room_state"]);
        assert_eq!(types(&guest.drain()), vec!["participant_joined"]);
    }

    #[tokio::test]
    async fn test_guest_disconnect_keeps_host() {
        let h = Harness::new();
        let (mut host, mut guest, room_id) = room_with_guest(&h).await;
        guest.session.disconnect().await;
        assert_eq!(types(&host.drain()), vec!["participant_left"]);
        assert_eq!(h.registry.read(&room_id, |r| r.host_id.clone()).await.unwrap(), "host");
    }
}
