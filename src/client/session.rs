#![forbid(unsafe_code)]

// WebSocket client session: one connection, one ClockSync, one SyncEngine

use super::clock::{ClockSync, DEFAULT_PROBE_INTERVAL};
use super::player::Player;
use super::sync_engine::{SyncConfig, SyncEngine};
use crate::playback::PlaybackState;
use crate::signaling::protocol::{
    ChatMessagePayload, ClientMessage, CreateRoomPayload, JoinRoomPayload, MediaDurationPayload, PingPayload,
    RoomRef, SeekPayload, ServerMessage, SetMediaPayload, SetRatePayload, TransferHostPayload,
};
use crate::time::SystemClock;
use anyhow::{anyhow, bail, Context};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const OUTBOUND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything the session observed, republished for the application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Message(ServerMessage),
    Disconnected,
}

#[derive(Debug, Default)]
struct Identity {
    participant_id: Option<String>,
    room_id: Option<String>,
}

/// State the reader task routes incoming messages into.
#[derive(Clone)]
struct Router {
    clock: ClockSync,
    engine: SyncEngine,
    player: Arc<dyn Player>,
    identity: Arc<StdRwLock<Identity>>,
    outbound: mpsc::Sender<Message>,
}

impl Router {
    fn is_me(&self, id: &str) -> bool {
        let identity = self.identity.read().unwrap_or_else(|e| e.into_inner());
        identity.participant_id.as_deref() == Some(id)
    }

    fn bind(&self, room_id: &str, participant_id: &str) {
        let mut identity = self.identity.write().unwrap_or_else(|e| e.into_inner());
        identity.room_id = Some(room_id.to_string());
        identity.participant_id = Some(participant_id.to_string());
    }

    fn route(&self, message: &ServerMessage, timestamp: Option<i64>) {
        match message {
            ServerMessage::Pong(pong) => {
                self.clock.process_pong(pong.client_time, pong.server_time);
            }
            ServerMessage::RoomCreated(created) => {
                self.bind(&created.room_id, &created.participant_id);
                self.engine.set_host(true);
            }
            ServerMessage::RoomJoined(joined) => {
                self.bind(&joined.room_id, &joined.participant_id);
            }
            ServerMessage::RoomState(state) => {
                self.engine.set_host(self.is_me(&state.room.host_id));
                self.engine.apply_server_state(state.playback_state.state);
            }
            ServerMessage::PlaybackState(playback) => {
                self.engine.apply_server_state(playback.state);
            }
            ServerMessage::HostChanged(changed) => {
                let me = self.is_me(&changed.new_host_id);
                if me {
                    info!("This session is now host");
                }
                self.engine.set_host(me);
            }
            ServerMessage::MediaSet(media) => {
                let now = timestamp.unwrap_or_else(|| self.clock.server_now().round() as i64);
                self.engine.apply_server_state(PlaybackState::new(now));
                if self.engine.is_host() {
                    if let Some(duration) = self.player.duration() {
                        debug!("Reporting duration {:.1}s for {}", duration, media.media_url);
                        let report = ClientMessage::MediaDuration(MediaDurationPayload {
                            room_id: None,
                            duration,
                        });
                        if let Err(e) = enqueue(&self.outbound, &report) {
                            warn!("Failed to report media duration: {}", e);
                        }
                    }
                }
            }
            ServerMessage::Error(error) => {
                debug!("Server rejected command: {} {}", error.code, error.message);
            }
            _ => {}
        }
    }
}

fn enqueue(outbound: &mpsc::Sender<Message>, message: &ClientMessage) -> anyhow::Result<()> {
    let text = serde_json::to_string(message)?;
    outbound
        .try_send(Message::Text(text.into()))
        .map_err(|e| anyhow!("outbound queue unavailable: {}", e))
}

/// A connected participant session.
///
/// Sends are fire-and-forget: they enqueue and return. Server replies and
/// broadcasts arrive as [`ClientEvent`]s via [`SyncClient::subscribe`].
pub struct SyncClient {
    outbound: StdMutex<Option<mpsc::Sender<Message>>>,
    events: broadcast::Sender<ClientEvent>,
    clock: ClockSync,
    engine: SyncEngine,
    identity: Arc<StdRwLock<Identity>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    writer: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SyncClient {
    /// Connects to a `ws://` or `wss://` signaling endpoint and starts clock
    /// probing and drift correction for `player`.
    ///
    /// # Errors
    /// Returns an error if the URL is not a WebSocket URL or the handshake fails
    pub async fn connect(url: &str, player: Arc<dyn Player>, config: SyncConfig) -> anyhow::Result<Self> {
        let parsed = url::Url::parse(url).with_context(|| format!("invalid server URL {url}"))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            bail!("unsupported URL scheme {:?}", parsed.scheme());
        }

        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        info!("Connected to {}", url);
        let (mut sink, mut stream) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let clock = ClockSync::new(Arc::new(SystemClock));
        let engine = SyncEngine::new(config, clock.clone());
        engine.attach(player.clone());
        engine.start();

        let identity = Arc::new(StdRwLock::new(Identity::default()));
        let router = Router {
            clock: clock.clone(),
            engine: engine.clone(),
            player,
            identity: identity.clone(),
            outbound: tx.clone(),
        };
        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok((message, timestamp)) => {
                            router.route(&message, timestamp);
                            let _ = reader_events.send(ClientEvent::Message(message));
                        }
                        Err(e) => warn!("Undecodable server message: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
            router.clock.stop();
            let _ = reader_events.send(ClientEvent::Disconnected);
            info!("Disconnected from server");
        });

        let probe_tx = tx.clone();
        clock.start(DEFAULT_PROBE_INTERVAL, move |client_time| {
            let probe = ClientMessage::Ping(PingPayload { client_time });
            // A dropped probe just means no sample this round
            let _ = enqueue(&probe_tx, &probe);
        });

        Ok(Self {
            outbound: StdMutex::new(Some(tx)),
            events,
            clock,
            engine,
            identity,
            reader: StdMutex::new(Some(reader)),
            writer: StdMutex::new(Some(writer)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn participant_id(&self) -> Option<String> {
        self.identity.read().unwrap_or_else(|e| e.into_inner()).participant_id.clone()
    }

    pub fn room_id(&self) -> Option<String> {
        self.identity.read().unwrap_or_else(|e| e.into_inner()).room_id.clone()
    }

    pub fn is_host(&self) -> bool {
        self.engine.is_host()
    }

    /// Queues a command without waiting for the socket.
    ///
    /// # Errors
    /// Returns an error if the session is closed or the outbound queue is full
    pub fn send(&self, message: ClientMessage) -> anyhow::Result<()> {
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        let tx = outbound.as_ref().ok_or_else(|| anyhow!("session closed"))?;
        enqueue(tx, &message)
    }

    pub fn create_room(&self, nickname: &str, password: Option<&str>, max_participants: Option<usize>) -> anyhow::Result<()> {
        self.send(ClientMessage::CreateRoom(CreateRoomPayload {
            nickname: nickname.to_string(),
            password: password.map(str::to_string),
            max_participants,
        }))
    }

    pub fn join_room(&self, room_id: &str, nickname: &str, password: Option<&str>) -> anyhow::Result<()> {
        self.send(ClientMessage::JoinRoom(JoinRoomPayload {
            room_id: room_id.to_string(),
            nickname: nickname.to_string(),
            password: password.map(str::to_string),
        }))
    }

    pub fn set_media(&self, media_url: &str) -> anyhow::Result<()> {
        self.send(ClientMessage::SetMedia(SetMediaPayload {
            room_id: None,
            media_url: media_url.to_string(),
        }))
    }

    pub fn play(&self) -> anyhow::Result<()> {
        self.send(ClientMessage::Play(RoomRef::default()))
    }

    pub fn pause(&self) -> anyhow::Result<()> {
        self.send(ClientMessage::Pause(RoomRef::default()))
    }

    pub fn seek(&self, position: f64) -> anyhow::Result<()> {
        self.send(ClientMessage::Seek(SeekPayload { room_id: None, position }))
    }

    pub fn set_rate(&self, rate: f64) -> anyhow::Result<()> {
        self.send(ClientMessage::SetRate(SetRatePayload { room_id: None, rate }))
    }

    pub fn report_duration(&self, duration: f64) -> anyhow::Result<()> {
        self.send(ClientMessage::MediaDuration(MediaDurationPayload { room_id: None, duration }))
    }

    pub fn transfer_host(&self, target_id: &str) -> anyhow::Result<()> {
        self.send(ClientMessage::TransferHost(TransferHostPayload {
            target_id: target_id.to_string(),
        }))
    }

    pub fn chat(&self, text: &str) -> anyhow::Result<()> {
        self.send(ClientMessage::ChatMessage(ChatMessagePayload {
            room_id: None,
            text: text.to_string(),
        }))
    }

    /// Stops probing and correction, then closes the socket. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.clock.stop();
        self.engine.destroy();

        // The writer ends once every sender is gone
        drop(self.outbound.lock().unwrap_or_else(|e| e.into_inner()).take());
        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(reader) = reader {
            reader.abort();
        }
        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        debug!("Sync client closed");
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.clock.stop();
        self.engine.destroy();
        for slot in [&self.reader, &self.writer] {
            if let Some(handle) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                handle.abort();
            }
        }
    }
}
