//! Server configuration.
//!
//! Every knob has a default. [`ServerConfig::from_env`] overrides them
//! from `TYPEROOM_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typeroom_game::GameConfig;
use typeroom_presence::PresenceConfig;
use typeroom_stream::StreamConfig;

use crate::TyperoomError;

/// Per-connection limits and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Outbound frames queued per connection before it is dropped as a
    /// slow consumer.
    pub queue_capacity: usize,

    /// Time allowed between accepting the socket and its `attach` frame.
    pub handshake_timeout: Duration,

    /// A connection that sends nothing for this long is closed.
    pub idle_timeout: Duration,

    /// Minimum spacing of cursor updates fanned out for one connection.
    pub cursor_throttle: Duration,

    /// How often a live connection refreshes its presence expiry.
    pub keepalive_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            cursor_throttle: Duration::from_millis(400),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// Everything needed to start a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub connection: ConnectionConfig,
    pub game: GameConfig,
    pub presence: PresenceConfig,
    pub stream: StreamConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            connection: ConnectionConfig::default(),
            game: GameConfig::default(),
            presence: PresenceConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by any `TYPEROOM_*` variables that are set.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `TYPEROOM_BIND` | `bind_addr` |
    /// | `TYPEROOM_QUORUM` | `game.quorum` |
    /// | `TYPEROOM_COUNTDOWN_SECS` | `game.countdown` |
    /// | `TYPEROOM_RESULTS_WAIT_SECS` | `game.results_wait` |
    /// | `TYPEROOM_GAME_DURATION_SECS` | `game.default_game_duration` |
    /// | `TYPEROOM_CONNECTION_TTL_SECS` | `presence.connection_ttl` |
    /// | `TYPEROOM_POLL_INTERVAL_MS` | `stream.poll_interval` |
    /// | `TYPEROOM_QUEUE_CAPACITY` | `connection.queue_capacity` |
    /// | `TYPEROOM_IDLE_TIMEOUT_SECS` | `connection.idle_timeout` |
    /// | `TYPEROOM_KEEPALIVE_SECS` | `connection.keepalive_interval` |
    pub fn from_env() -> Result<Self, TyperoomError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through
    /// `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, TyperoomError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let secs = |key: &str| parse::<u64>(&lookup, key).map(|v| v.map(Duration::from_secs));

        if let Some(addr) = lookup("TYPEROOM_BIND") {
            config.bind_addr = addr;
        }
        if let Some(quorum) = parse::<usize>(&lookup, "TYPEROOM_QUORUM")? {
            if quorum == 0 {
                return Err(TyperoomError::Config("TYPEROOM_QUORUM must be at least 1".into()));
            }
            config.game.quorum = quorum;
        }
        if let Some(d) = secs("TYPEROOM_COUNTDOWN_SECS")? {
            config.game.countdown = d;
        }
        if let Some(d) = secs("TYPEROOM_RESULTS_WAIT_SECS")? {
            config.game.results_wait = d;
        }
        if let Some(d) = secs("TYPEROOM_GAME_DURATION_SECS")? {
            config.game.default_game_duration = d;
        }
        if let Some(d) = secs("TYPEROOM_CONNECTION_TTL_SECS")? {
            config.presence.connection_ttl = d;
        }
        if let Some(ms) = parse::<u64>(&lookup, "TYPEROOM_POLL_INTERVAL_MS")? {
            config.stream.poll_interval = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse::<usize>(&lookup, "TYPEROOM_QUEUE_CAPACITY")? {
            config.connection.queue_capacity = capacity.max(1);
        }
        if let Some(d) = secs("TYPEROOM_IDLE_TIMEOUT_SECS")? {
            config.connection.idle_timeout = d;
        }
        if let Some(d) = secs("TYPEROOM_KEEPALIVE_SECS")? {
            config.connection.keepalive_interval = d;
        }
        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, TyperoomError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| TyperoomError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.game.quorum, 2);
        assert_eq!(config.game.countdown, Duration::from_secs(5));
        assert_eq!(config.game.results_wait, Duration::from_secs(10));
        assert_eq!(config.presence.connection_ttl, Duration::from_secs(600));
        assert_eq!(config.connection.queue_capacity, 64);
        assert_eq!(config.connection.cursor_throttle, Duration::from_millis(400));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("TYPEROOM_BIND", "0.0.0.0:9000"),
            ("TYPEROOM_QUORUM", "3"),
            ("TYPEROOM_RESULTS_WAIT_SECS", " 20 "),
            ("TYPEROOM_POLL_INTERVAL_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.game.quorum, 3);
        assert_eq!(config.game.results_wait, Duration::from_secs(20));
        assert_eq!(config.stream.poll_interval, Duration::from_millis(250));
        // Untouched values keep their defaults.
        assert_eq!(config.game.countdown, Duration::from_secs(5));
    }

    #[test]
    fn test_bad_values_are_rejected() {
        let err = ServerConfig::from_lookup(lookup(&[("TYPEROOM_COUNTDOWN_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, TyperoomError::Config(_)));
        assert!(err.to_string().contains("TYPEROOM_COUNTDOWN_SECS"));

        assert!(ServerConfig::from_lookup(lookup(&[("TYPEROOM_QUORUM", "0")])).is_err());
    }
}
