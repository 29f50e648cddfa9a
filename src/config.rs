#![forbid(unsafe_code)]

// Process configuration from environment variables

use crate::room::settings::{DEFAULT_MAX_PARTICIPANTS, MAX_PARTICIPANTS_LIMIT};
use crate::room::RegistryConfig;
use crate::signaling::heartbeat::HeartbeatConfig;
use crate::store::DEFAULT_ROOM_TTL;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    pub rate_limit_per_sec: u32,
    pub heartbeat_interval: Duration,
    pub liveness_timeout: Duration,
    pub room_cleanup_delay: Duration,
    pub room_ttl: Duration,
    pub default_max_participants: usize,
    pub database_url: Option<String>,
    pub metrics_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            max_connections: 10_000,
            rate_limit_per_sec: 10,
            heartbeat_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(60),
            room_cleanup_delay: Duration::from_secs(300),
            room_ttl: DEFAULT_ROOM_TTL,
            default_max_participants: DEFAULT_MAX_PARTICIPANTS,
            database_url: None,
            metrics_token: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Unparseable or zero values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |key: &str, fallback: Duration| {
            Duration::from_secs(parse_nonzero(&lookup, key, fallback.as_secs()))
        };

        Self {
            port: parse_nonzero(&lookup, "PORT", defaults.port),
            max_connections: parse_nonzero(&lookup, "MAX_CONNECTIONS", defaults.max_connections),
            rate_limit_per_sec: parse_nonzero(&lookup, "RATE_LIMIT_PER_SEC", defaults.rate_limit_per_sec),
            heartbeat_interval: secs("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval),
            liveness_timeout: secs("LIVENESS_TIMEOUT_SECS", defaults.liveness_timeout),
            room_cleanup_delay: secs("ROOM_CLEANUP_DELAY_SECS", defaults.room_cleanup_delay),
            room_ttl: secs("ROOM_TTL_SECS", defaults.room_ttl),
            default_max_participants: parse_nonzero(&lookup, "DEFAULT_MAX_PARTICIPANTS", defaults.default_max_participants)
                .min(MAX_PARTICIPANTS_LIMIT),
            database_url: lookup("DATABASE_URL").filter(|v| !v.is_empty()),
            metrics_token: lookup("METRICS_TOKEN").filter(|v| !v.is_empty()),
        }
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            cleanup_delay: self.room_cleanup_delay,
            default_max_participants: self.default_max_participants,
        }
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: self.heartbeat_interval,
            liveness_timeout: self.liveness_timeout,
        }
    }
}

fn parse_nonzero<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, fallback: T) -> T
where
    T: FromStr + PartialEq + Default + Copy + std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return fallback;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value == T::default() => {
            warn!("{}=0 is not allowed, using default {}", key, fallback);
            fallback
        }
        Ok(value) => value,
        Err(_) => {
            warn!("Invalid {}={:?}, using default {}", key, raw, fallback);
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> ServerConfig {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ServerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);
        assert_eq!(config.port, 3001);
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.rate_limit_per_sec, 10);
        assert_eq!(config.heartbeat().interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat().liveness_timeout, Duration::from_secs(60));
        assert_eq!(config.registry().cleanup_delay, Duration::from_secs(300));
        assert_eq!(config.room_ttl, Duration::from_secs(86_400));
        assert_eq!(config.registry().default_max_participants, 20);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = config(&[
            ("PORT", "8080"),
            ("MAX_CONNECTIONS", "0"),
            ("RATE_LIMIT_PER_SEC", "abc"),
            ("ROOM_CLEANUP_DELAY_SECS", "5"),
            ("DEFAULT_MAX_PARTICIPANTS", "500"),
            ("DATABASE_URL", "postgres://localhost/syncwatch"),
            ("METRICS_TOKEN", ""),
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.rate_limit_per_sec, 10);
        assert_eq!(config.room_cleanup_delay, Duration::from_secs(5));
        assert_eq!(config.default_max_participants, MAX_PARTICIPANTS_LIMIT);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/syncwatch"));
        assert!(config.metrics_token.is_none());
    }
}
