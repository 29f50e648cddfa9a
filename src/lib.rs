#![forbid(unsafe_code)]

// SyncWatch library - shared-room playback synchronization server and client engine

pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod playback;
pub mod rate_limit;
pub mod room;
pub mod schedule;
pub mod signaling;
pub mod store;
pub mod time;
