#![forbid(unsafe_code)]

// Playback model - authoritative transport state and its position arithmetic.
//
// `offset` is always the position (seconds) as of `server_timestamp` (ms); every
// mutation refreshes the timestamp so the two never drift apart.

use serde::{Deserialize, Serialize};
use url::Url;

pub const MIN_RATE: f64 = 0.5;
pub const MAX_RATE: f64 = 2.0;

/// Transport state shared by the server (authoritative) and clients (predictive).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub is_playing: bool,
    pub offset: f64,
    pub server_timestamp: i64,
    pub rate: f64,
}

impl PlaybackState {
    /// Paused at zero, normal speed.
    pub fn new(now: i64) -> Self {
        Self {
            is_playing: false,
            offset: 0.0,
            server_timestamp: now,
            rate: 1.0,
        }
    }

    /// Position (seconds) predicted at `now` (ms on the authoritative clock).
    pub fn expected_position(&self, now: i64) -> f64 {
        if self.is_playing {
            self.offset + (now - self.server_timestamp) as f64 / 1000.0 * self.rate
        } else {
            self.offset
        }
    }

    /// Folds elapsed play time into `offset` and moves the timestamp to `now`.
    fn advance(&mut self, now: i64, duration: Option<f64>) {
        if self.is_playing {
            let elapsed = (now - self.server_timestamp).max(0) as f64 / 1000.0;
            self.offset = clamp_position(self.offset + elapsed * self.rate, duration);
        }
        self.server_timestamp = now;
    }

    /// Starts playback. Returns `false` (no change) if already playing.
    pub fn play(&mut self, now: i64) -> bool {
        if self.is_playing {
            return false;
        }
        self.is_playing = true;
        self.server_timestamp = now;
        true
    }

    /// Pauses playback at the current position. Returns `false` if already paused.
    pub fn pause(&mut self, now: i64, duration: Option<f64>) -> bool {
        if !self.is_playing {
            return false;
        }
        self.advance(now, duration);
        self.is_playing = false;
        true
    }

    /// Jumps to `position`, clamped to the media bounds. Play state is unchanged.
    pub fn seek(&mut self, position: f64, duration: Option<f64>, now: i64) {
        self.offset = clamp_position(position, duration);
        self.server_timestamp = now;
    }

    /// Changes speed; elapsed time up to `now` is accounted at the old rate.
    pub fn set_rate(&mut self, rate: f64, duration: Option<f64>, now: i64) {
        self.advance(now, duration);
        self.rate = clamp_rate(rate);
    }

    /// Re-clamps the stored offset after the media duration becomes known.
    pub fn clamp_to(&mut self, duration: Option<f64>, now: i64) {
        self.advance(now, duration);
        self.offset = clamp_position(self.offset, duration);
    }
}

/// Clamps to `[0, duration]`; no upper bound when the duration is unknown.
pub fn clamp_position(position: f64, duration: Option<f64>) -> f64 {
    let lower = position.max(0.0);
    match duration {
        Some(d) if d > 0.0 => lower.min(d),
        _ => lower,
    }
}

pub fn clamp_rate(rate: f64) -> f64 {
    rate.clamp(MIN_RATE, MAX_RATE)
}

/// Media source family, decided from the URL host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Youtube,
    Vk,
    Direct,
}

impl MediaType {
    pub fn classify(url: &Url) -> Self {
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host);
        let matches = |domain: &str| host == domain || host.ends_with(&format!(".{domain}"));

        if matches("youtube.com") || matches("youtu.be") || matches("youtube-nocookie.com") {
            MediaType::Youtube
        } else if matches("vk.com") || matches("vkvideo.ru") {
            MediaType::Vk
        } else {
            MediaType::Direct
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Youtube => "youtube",
            MediaType::Vk => "vk",
            MediaType::Direct => "direct",
        }
    }
}

/// Media currently loaded in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    #[serde(rename = "type")]
    pub media_type: MediaType,
    pub source: String,
    /// Seconds; `None` until a client reports it.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl MediaInfo {
    /// Accepts absolute `http`/`https` URLs only. `source` keeps the caller's spelling.
    pub fn from_url(raw: &str) -> Option<Self> {
        let url = Url::parse(raw).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        Some(Self {
            media_type: MediaType::classify(&url),
            source: raw.to_string(),
            duration: None,
            title: None,
        })
    }
}
