#![forbid(unsafe_code)]

// Player abstraction: the transport capabilities the sync engine drives

use crate::playback::{clamp_position, MediaType};
use std::sync::Mutex as StdMutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

const EVENT_CAPACITY: usize = 32;

/// Backend family a player implementation wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerKind {
    /// A plain video element playing a direct file URL
    NativeElement,
    /// A third-party embed SDK (YouTube, VK)
    EmbeddedSdk,
}

impl PlayerKind {
    pub fn for_media(media_type: MediaType) -> Self {
        match media_type {
            MediaType::Youtube | MediaType::Vk => PlayerKind::EmbeddedSdk,
            MediaType::Direct => PlayerKind::NativeElement,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Ready { duration: Option<f64> },
    Play,
    Pause,
    Seeked { position: f64 },
    RateChanged { rate: f64 },
    Ended,
    Error(String),
}

/// Capability set every playback backend exposes. Positions are seconds.
pub trait Player: Send + Sync {
    fn kind(&self) -> PlayerKind;
    fn play(&self);
    fn pause(&self);
    fn seek(&self, position: f64);
    fn set_rate(&self, rate: f64);
    fn position(&self) -> f64;
    fn duration(&self) -> Option<f64>;
    fn rate(&self) -> f64;
    fn is_playing(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent>;
}

struct SimulatedState {
    anchor_position: f64,
    anchor: Instant,
    playing: bool,
    rate: f64,
    ended: bool,
}

/// Headless player that advances with `tokio::time`, so paused-clock tests
/// control it exactly.
///
/// `skew` scales how fast the simulated decoder really runs relative to its
/// nominal rate; anything other than 1.0 makes it drift.
pub struct SimulatedPlayer {
    kind: PlayerKind,
    duration: Option<f64>,
    skew: f64,
    state: StdMutex<SimulatedState>,
    events: broadcast::Sender<PlayerEvent>,
}

impl SimulatedPlayer {
    pub fn new(kind: PlayerKind, duration: Option<f64>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            kind,
            duration,
            skew: 1.0,
            state: StdMutex::new(SimulatedState {
                anchor_position: 0.0,
                anchor: Instant::now(),
                playing: false,
                rate: 1.0,
                ended: false,
            }),
            events,
        }
    }

    pub fn with_skew(mut self, skew: f64) -> Self {
        if skew.is_finite() && skew > 0.0 {
            self.skew = skew;
        }
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: PlayerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn position_of(&self, state: &SimulatedState) -> f64 {
        if !state.playing {
            return state.anchor_position;
        }
        let elapsed = state.anchor.elapsed().as_secs_f64();
        clamp_position(state.anchor_position + elapsed * state.rate * self.skew, self.duration)
    }

    /// Folds elapsed time into the anchor, so rate or play changes take effect from now.
    fn rebase(&self, state: &mut SimulatedState) {
        state.anchor_position = self.position_of(state);
        state.anchor = Instant::now();
        if let Some(duration) = self.duration {
            if state.playing && state.anchor_position >= duration && !state.ended {
                state.ended = true;
                state.playing = false;
                self.emit(PlayerEvent::Ended);
            }
        }
    }

    /// Emits `Ready`, as a backend does once metadata has loaded.
    pub fn load(&self) {
        self.emit(PlayerEvent::Ready { duration: self.duration });
    }
}

impl Player for SimulatedPlayer {
    fn kind(&self) -> PlayerKind {
        self.kind
    }

    fn play(&self) {
        let mut state = self.lock();
        self.rebase(&mut state);
        if state.playing {
            return;
        }
        state.playing = true;
        state.ended = false;
        drop(state);
        self.emit(PlayerEvent::Play);
    }

    fn pause(&self) {
        let mut state = self.lock();
        self.rebase(&mut state);
        if !state.playing {
            return;
        }
        state.playing = false;
        drop(state);
        self.emit(PlayerEvent::Pause);
    }

    fn seek(&self, position: f64) {
        let mut state = self.lock();
        state.anchor_position = clamp_position(position, self.duration);
        state.anchor = Instant::now();
        state.ended = false;
        let position = state.anchor_position;
        drop(state);
        self.emit(PlayerEvent::Seeked { position });
    }

    fn set_rate(&self, rate: f64) {
        if !rate.is_finite() || rate <= 0.0 {
            return;
        }
        let mut state = self.lock();
        self.rebase(&mut state);
        if state.rate == rate {
            return;
        }
        state.rate = rate;
        drop(state);
        self.emit(PlayerEvent::RateChanged { rate });
    }

    fn position(&self) -> f64 {
        let state = self.lock();
        self.position_of(&state)
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn rate(&self) -> f64 {
        self.lock().rate
    }

    fn is_playing(&self) -> bool {
        let mut state = self.lock();
        self.rebase(&mut state);
        state.playing
    }

    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }
}
