#![forbid(unsafe_code)]

// Drift correction for non-host participants.
//
// Every `sync_interval` the engine predicts where playback should be on the
// server clock and compares it with the local player: small drift is ignored,
// medium drift is absorbed by nudging the rate, large drift is a hard seek.

use super::clock::ClockSync;
use super::player::Player;
use crate::playback::PlaybackState;
use crate::schedule::ScheduledTask;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CORRECTION_CAPACITY: usize = 64;

/// Thresholds are in milliseconds of drift.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub no_action_threshold_ms: f64,
    /// At or above this the engine seeks instead of nudging the rate
    pub hard_seek_threshold_ms: f64,
    pub sync_interval: Duration,
    pub speed_up_rate: f64,
    pub slow_down_rate: f64,
    /// Corrections are suspended this long after a hard seek
    pub settle_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            no_action_threshold_ms: 100.0,
            hard_seek_threshold_ms: 300.0,
            sync_interval: Duration::from_millis(1000),
            speed_up_rate: 1.05,
            slow_down_rate: 0.95,
            settle_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    /// Player bound, timer not started
    Armed,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CorrectionAction {
    /// Within tolerance; rate restored to the server rate
    None,
    SpeedUp { rate: f64 },
    SlowDown { rate: f64 },
    HardSeek { position: f64 },
}

/// One evaluation of the sync loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    /// Positive means the local player is ahead
    pub drift_ms: f64,
    pub expected_position: f64,
    pub action: CorrectionAction,
}

/// Chooses the correction for a drift. Paused playback is never rate-nudged.
pub fn evaluate(drift_ms: f64, expected_position: f64, server: &PlaybackState, config: &SyncConfig) -> CorrectionAction {
    let magnitude = drift_ms.abs();
    if magnitude < config.no_action_threshold_ms {
        return CorrectionAction::None;
    }
    if magnitude >= config.hard_seek_threshold_ms || !server.is_playing {
        return CorrectionAction::HardSeek {
            position: expected_position,
        };
    }
    if drift_ms > 0.0 {
        CorrectionAction::SlowDown {
            rate: server.rate * config.slow_down_rate,
        }
    } else {
        CorrectionAction::SpeedUp {
            rate: server.rate * config.speed_up_rate,
        }
    }
}

struct EngineState {
    phase: SyncPhase,
    player: Option<Arc<dyn Player>>,
    server_state: Option<PlaybackState>,
    is_host: bool,
    settle_until: Option<Instant>,
    last_drift_ms: Option<f64>,
}

struct EngineInner {
    config: SyncConfig,
    clock: ClockSync,
    state: StdMutex<EngineState>,
    corrections: broadcast::Sender<Correction>,
    timer: StdMutex<Option<ScheduledTask>>,
}

/// Keeps a local player aligned with the room's authoritative playback state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, clock: ClockSync) -> Self {
        let (corrections, _) = broadcast::channel(CORRECTION_CAPACITY);
        Self {
            inner: Arc::new(EngineInner {
                config,
                clock,
                state: StdMutex::new(EngineState {
                    phase: SyncPhase::Idle,
                    player: None,
                    server_state: None,
                    is_host: false,
                    settle_until: None,
                    last_drift_ms: None,
                }),
                corrections,
                timer: StdMutex::new(None),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn phase(&self) -> SyncPhase {
        self.lock().phase
    }

    /// Binds the player to drive. Rebinding replaces the previous player.
    pub fn attach(&self, player: Arc<dyn Player>) {
        let mut state = self.lock();
        match state.phase {
            SyncPhase::Stopped => {
                warn!("Sync engine already destroyed, ignoring player");
            }
            SyncPhase::Idle => {
                state.player = Some(player);
                state.phase = SyncPhase::Armed;
            }
            SyncPhase::Armed | SyncPhase::Running => {
                state.player = Some(player);
            }
        }
    }

    /// Starts the periodic check. Only valid once a player is attached.
    pub fn start(&self) -> bool {
        {
            let mut state = self.lock();
            if state.phase != SyncPhase::Armed {
                debug!("Sync engine start ignored in {:?}", state.phase);
                return false;
            }
            state.phase = SyncPhase::Running;
        }

        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let task = ScheduledTask::every(self.inner.config.sync_interval, false, move || {
            if let Some(inner) = weak.upgrade() {
                SyncEngine { inner }.synchronize();
            }
            async {}
        });
        *self.inner.timer.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        info!("Sync engine running every {:?}", self.inner.config.sync_interval);
        true
    }

    /// Stops the timer and releases the player. Safe from any phase, any number of times.
    pub fn destroy(&self) {
        let timer = self.inner.timer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(timer) = timer {
            timer.cancel();
        }
        let mut state = self.lock();
        if state.phase == SyncPhase::Stopped {
            return;
        }
        state.phase = SyncPhase::Stopped;
        state.player = None;
        state.server_state = None;
        state.settle_until = None;
        debug!("Sync engine destroyed");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Correction> {
        self.inner.corrections.subscribe()
    }

    /// Last measured drift in milliseconds, if any measurement has happened.
    pub fn drift_ms(&self) -> Option<f64> {
        self.lock().last_drift_ms
    }

    pub fn server_state(&self) -> Option<PlaybackState> {
        self.lock().server_state
    }

    pub fn is_host(&self) -> bool {
        self.lock().is_host
    }

    /// Hosts are authoritative and never correct against their own broadcasts.
    pub fn set_host(&self, is_host: bool) {
        let mut state = self.lock();
        if state.is_host == is_host {
            return;
        }
        state.is_host = is_host;
        state.settle_until = None;
        if is_host {
            // Drop any nudge in progress
            if let (Some(player), Some(server)) = (&state.player, &state.server_state) {
                player.set_rate(server.rate);
            }
        }
    }

    /// Records a new authoritative state and, for non-hosts, drives the player to it.
    pub fn apply_server_state(&self, server: PlaybackState) {
        let server_now = self.inner.clock.server_now().round() as i64;
        let mut state = self.lock();
        state.server_state = Some(server);
        if state.is_host || state.phase == SyncPhase::Stopped {
            return;
        }
        let Some(player) = state.player.clone() else {
            return;
        };

        let expected = server.expected_position(server_now);
        let off_by_ms = (player.position() - expected).abs() * 1000.0;
        if server.is_playing {
            if off_by_ms >= self.inner.config.no_action_threshold_ms {
                player.seek(expected);
            }
            player.set_rate(server.rate);
            if !player.is_playing() {
                player.play();
            }
        } else {
            if player.is_playing() {
                player.pause();
            }
            if off_by_ms >= self.inner.config.no_action_threshold_ms {
                player.seek(expected);
            }
            player.set_rate(server.rate);
        }
        // A fresh state is a fresh baseline
        state.settle_until = None;
    }

    /// Runs one check against the current server clock estimate.
    pub fn synchronize(&self) -> Option<Correction> {
        let server_now = self.inner.clock.server_now();
        self.synchronize_at(server_now)
    }

    /// Runs one check as of `server_now` (ms). Returns `None` when there is
    /// nothing to evaluate: host, no player, no state, or settling after a seek.
    pub fn synchronize_at(&self, server_now: f64) -> Option<Correction> {
        let config = &self.inner.config;
        let mut state = self.lock();
        if state.is_host || !matches!(state.phase, SyncPhase::Armed | SyncPhase::Running) {
            return None;
        }
        let (Some(player), Some(server)) = (state.player.clone(), state.server_state) else {
            return None;
        };
        let now = Instant::now();
        if let Some(until) = state.settle_until {
            if now < until {
                return None;
            }
            state.settle_until = None;
        }

        let expected = server.expected_position(server_now.round() as i64);
        let drift_ms = (player.position() - expected) * 1000.0;
        state.last_drift_ms = Some(drift_ms);

        let action = evaluate(drift_ms, expected, &server, config);
        match action {
            CorrectionAction::None => {
                if player.rate() != server.rate {
                    player.set_rate(server.rate);
                }
            }
            CorrectionAction::SpeedUp { rate } | CorrectionAction::SlowDown { rate } => {
                debug!("Drift {:.0} ms, nudging rate to {:.3}", drift_ms, rate);
                player.set_rate(rate);
            }
            CorrectionAction::HardSeek { position } => {
                debug!("Drift {:.0} ms, seeking to {:.3}", drift_ms, position);
                state.settle_until = Some(now + config.settle_delay);
                player.seek(position);
                player.set_rate(server.rate);
            }
        }
        drop(state);

        let correction = Correction {
            drift_ms,
            expected_position: expected,
            action,
        };
        let _ = self.inner.corrections.send(correction);
        Some(correction)
    }
}
