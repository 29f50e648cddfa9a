#![forbid(unsafe_code)]

// Signaling protocol - JSON envelopes `{ type, payload, timestamp? }`

use crate::error::CommandError;
use crate::playback::{MediaType, PlaybackState};
use crate::room::VoiceState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw inbound envelope, before the payload is interpreted.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

/// Result of decoding one inbound frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    Command(ClientMessage),
    /// Well-formed envelope with a type this server does not know.
    Unknown(String),
}

/// Client-to-Server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateRoom(CreateRoomPayload),
    JoinRoom(JoinRoomPayload),
    SetMedia(SetMediaPayload),
    Play(RoomRef),
    Pause(RoomRef),
    Seek(SeekPayload),
    SetRate(SetRatePayload),
    /// Host reports the media duration once its player has loaded it
    MediaDuration(MediaDurationPayload),
    TransferHost(TransferHostPayload),
    ChatMessage(ChatMessagePayload),
    UpdateNickname(UpdateNicknamePayload),
    VoiceState(VoiceStatePayload),
    WebrtcSignal(WebRtcSignalPayload),
    Ping(PingPayload),
}

impl ClientMessage {
    pub const TYPES: &'static [&'static str] = &[
        "create_room",
        "join_room",
        "set_media",
        "play",
        "pause",
        "seek",
        "set_rate",
        "media_duration",
        "transfer_host",
        "chat_message",
        "update_nickname",
        "voice_state",
        "webrtc_signal",
        "ping",
    ];

    /// Decodes a text frame.
    ///
    /// # Errors
    /// `InvalidMessage` if the envelope itself is unparseable, `Validation` if a
    /// known command carries a malformed payload.
    pub fn parse(text: &str) -> Result<Inbound, CommandError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| CommandError::InvalidMessage(e.to_string()))?;

        if !Self::TYPES.contains(&envelope.kind.as_str()) {
            return Ok(Inbound::Unknown(envelope.kind));
        }

        let payload = match envelope.payload {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let tagged = serde_json::json!({ "type": envelope.kind, "payload": payload });
        serde_json::from_value(tagged)
            .map(Inbound::Command)
            .map_err(|e| CommandError::validation(format!("Invalid {} payload: {}", envelope.kind, e)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::CreateRoom(_) => "create_room",
            ClientMessage::JoinRoom(_) => "join_room",
            ClientMessage::SetMedia(_) => "set_media",
            ClientMessage::Play(_) => "play",
            ClientMessage::Pause(_) => "pause",
            ClientMessage::Seek(_) => "seek",
            ClientMessage::SetRate(_) => "set_rate",
            ClientMessage::MediaDuration(_) => "media_duration",
            ClientMessage::TransferHost(_) => "transfer_host",
            ClientMessage::ChatMessage(_) => "chat_message",
            ClientMessage::UpdateNickname(_) => "update_nickname",
            ClientMessage::VoiceState(_) => "voice_state",
            ClientMessage::WebrtcSignal(_) => "webrtc_signal",
            ClientMessage::Ping(_) => "ping",
        }
    }

    /// Room id the client claims to act on, if it sent one.
    pub fn claimed_room(&self) -> Option<&str> {
        match self {
            ClientMessage::SetMedia(p) => p.room_id.as_deref(),
            ClientMessage::Play(p) | ClientMessage::Pause(p) => p.room_id.as_deref(),
            ClientMessage::Seek(p) => p.room_id.as_deref(),
            ClientMessage::SetRate(p) => p.room_id.as_deref(),
            ClientMessage::MediaDuration(p) => p.room_id.as_deref(),
            ClientMessage::ChatMessage(p) => p.room_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomPayload {
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_participants: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    pub room_id: String,
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMediaPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub media_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeekPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub position: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetRatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDurationPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub duration: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferHostPayload {
    pub target_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNicknamePayload {
    pub nickname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceStatePayload {
    pub enabled: bool,
    pub muted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcSignalPayload {
    pub target_id: String,
    /// Opaque negotiation payload, relayed verbatim
    #[serde(default)]
    pub signal: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub client_time: f64,
}

/// Server-to-Client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    RoomCreated(RoomCreatedPayload),
    RoomJoined(RoomJoinedPayload),
    RoomState(RoomStatePayload),
    MediaSet(MediaSetPayload),
    PlaybackState(PlaybackStatePayload),
    ChatMessage(ChatBroadcast),
    HostChanged(HostChangedPayload),
    ParticipantJoined(ParticipantPayload),
    ParticipantUpdated(ParticipantPayload),
    ParticipantLeft(ParticipantLeftPayload),
    WebrtcSignal(RelayedSignal),
    Pong(PongPayload),
    Error(ErrorPayload),
}

impl ServerMessage {
    /// Serializes with the server send time attached to the envelope.
    pub fn encode(&self, timestamp: i64) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("timestamp".to_string(), Value::from(timestamp));
        }
        serde_json::to_string(&value)
    }

    /// Inverse of [`ServerMessage::encode`]: the message and its envelope timestamp.
    pub fn decode(text: &str) -> serde_json::Result<(Self, Option<i64>)> {
        let mut value: Value = serde_json::from_str(text)?;
        let timestamp = match &mut value {
            Value::Object(map) => map.remove("timestamp").and_then(|t| t.as_i64()),
            _ => None,
        };
        Ok((serde_json::from_value(value)?, timestamp))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::RoomCreated(_) => "room_created",
            ServerMessage::RoomJoined(_) => "room_joined",
            ServerMessage::RoomState(_) => "room_state",
            ServerMessage::MediaSet(_) => "media_set",
            ServerMessage::PlaybackState(_) => "playback_state",
            ServerMessage::ChatMessage(_) => "chat_message",
            ServerMessage::HostChanged(_) => "host_changed",
            ServerMessage::ParticipantJoined(_) => "participant_joined",
            ServerMessage::ParticipantUpdated(_) => "participant_updated",
            ServerMessage::ParticipantLeft(_) => "participant_left",
            ServerMessage::WebrtcSignal(_) => "webrtc_signal",
            ServerMessage::Pong(_) => "pong",
            ServerMessage::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreatedPayload {
    pub room_id: String,
    pub participant_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinedPayload {
    pub room_id: String,
    pub participant_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: String,
    pub created_at: i64,
    pub host_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatePayload {
    pub room: RoomInfo,
    pub participants: Vec<ParticipantInfo>,
    pub playback_state: PlaybackStatePayload,
}

/// Participant information for room state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: String,
    pub nickname: String,
    pub is_host: bool,
    pub joined_at: i64,
    pub last_seen: i64,
    pub voice: VoiceState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSetPayload {
    pub media_url: String,
    pub media_type: MediaType,
}

/// Playback model plus the media it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStatePayload {
    #[serde(flatten)]
    pub state: PlaybackState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    User,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBroadcast {
    pub id: String,
    pub sender_id: String,
    pub nickname: String,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostChangedPayload {
    pub new_host_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPayload {
    pub participant: ParticipantInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantLeftPayload {
    pub od_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedSignal {
    pub sender_id: String,
    pub signal: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub client_time: f64,
    pub server_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(text: &str) -> ClientMessage {
        match ClientMessage::parse(text).unwrap() {
            Inbound::Command(cmd) => cmd,
            Inbound::Unknown(kind) => panic!("unexpected unknown type {kind}"),
        }
    }

    #[test]
    fn test_parse_join_room() {
        let cmd = command(r#"{"type":"join_room","payload":{"roomId":"abc123xy","nickname":"Ann","password":"pw"}}"#);
        assert_eq!(
            cmd,
            ClientMessage::JoinRoom(JoinRoomPayload {
                room_id: "abc123xy".into(),
                nickname: "Ann".into(),
                password: Some("pw".into()),
            })
        );
    }

    #[test]
    fn test_parse_payloadless_commands() {
        assert_eq!(command(r#"{"type":"play"}"#), ClientMessage::Play(RoomRef::default()));
        assert_eq!(
            command(r#"{"type":"pause","payload":{"roomId":"r1"},"timestamp":5}"#),
            ClientMessage::Pause(RoomRef { room_id: Some("r1".into()) })
        );
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        match ClientMessage::parse(r#"{"type":"summon_dragon","payload":{}}"#).unwrap() {
            Inbound::Unknown(kind) => assert_eq!(kind, "summon_dragon"),
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_is_invalid_message() {
        let err = ClientMessage::parse("not json").unwrap_err();
        assert_eq!(err.code(), "INVALID_MESSAGE");
        let err = ClientMessage::parse(r#"{"payload":{}}"#).unwrap_err();
        assert_eq!(err.code(), "INVALID_MESSAGE");
    }

    #[test]
    fn test_bad_payload_is_validation_error() {
        let err = ClientMessage::parse(r#"{"type":"seek","payload":{"position":"soon"}}"#).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_signal_payload_is_opaque() {
        let cmd = command(r#"{"type":"webrtc_signal","payload":{"targetId":"p2","signal":{"sdp":"v=0","nested":[1,2]}}}"#);
        let ClientMessage::WebrtcSignal(payload) = cmd else { panic!("wrong variant") };
        assert_eq!(payload.signal["nested"][1], 2);
    }

    #[test]
    fn test_client_message_round_trips_through_parse() {
        let original = ClientMessage::Seek(SeekPayload { room_id: None, position: 12.5 });
        let text = serde_json::to_string(&original).unwrap();
        assert_eq!(command(&text), original);
    }

    #[test]
    fn test_type_names_cover_all_types() {
        for kind in ClientMessage::TYPES {
            assert!(!kind.is_empty());
        }
        assert_eq!(ClientMessage::TYPES.len(), 14);
        assert_eq!(ClientMessage::Ping(PingPayload { client_time: 1.0 }).type_name(), "ping");
    }

    #[test]
    fn test_encode_playback_state() {
        let msg = ServerMessage::PlaybackState(PlaybackStatePayload {
            state: PlaybackState { is_playing: true, offset: 3.0, server_timestamp: 1_000, rate: 1.0 },
            media_url: Some("https://youtube.com/watch?v=X".into()),
            media_type: Some(MediaType::Youtube),
            duration: None,
        });
        let text = msg.encode(1_234).unwrap();
        let json: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "playback_state");
        assert_eq!(json["timestamp"], 1_234);
        assert_eq!(json["payload"]["isPlaying"], true);
        assert_eq!(json["payload"]["mediaType"], "youtube");
        assert!(json["payload"].get("duration").is_none());

        let (back, timestamp) = ServerMessage::decode(&text).unwrap();
        assert_eq!(back, msg);
        assert_eq!(timestamp, Some(1_234));
    }

    #[test]
    fn test_participant_left_wire_name() {
        let msg = ServerMessage::ParticipantLeft(ParticipantLeftPayload { od_id: "p1".into() });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["payload"]["odId"], "p1");
    }
}
