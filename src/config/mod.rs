//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (comma-separated, `*` for any)
    pub client_origin: String,

    /// Match timing and broadcast cadence
    pub game: GameConfig,

    /// Number of socket writes allowed in flight across all sessions
    pub sender_pool_size: usize,
    /// Outbound frames buffered per session before frames are dropped
    pub session_queue_capacity: usize,
    /// Inbound messages allowed per connection per second
    pub input_rate_limit: u32,

    /// Idle sweep cadence
    pub sweep_interval: Duration,
    /// Idle tolerance for players still in the lobby/queue
    pub lobby_timeout: Duration,
    /// Idle tolerance for players bound to a match
    pub ingame_timeout: Duration,

    /// Whether per-tick positions are logged at all
    pub position_log_enabled: bool,
    /// Pending records kept before new ones are dropped
    pub position_log_capacity: usize,
    /// Optional JSON-lines file for the position log
    pub position_log_path: Option<PathBuf>,

    /// Seed for practice spawn positions (random when unset)
    pub practice_seed: Option<u64>,
}

/// Per-match settings handed to every simulation context
#[derive(Clone, Copy, Debug)]
pub struct GameConfig {
    pub countdown_secs: u64,
    pub round_secs: u64,
    /// Broadcast a snapshot every N ticks
    pub broadcast_skip: u32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            countdown_secs: 5,
            round_secs: 180,
            broadcast_skip: 1,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render-style PORT wins over SERVER_ADDR
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let game = GameConfig {
            countdown_secs: parse_or("COUNTDOWN_SECS", 5)?,
            round_secs: parse_or("ROUND_SECS", 180)?,
            broadcast_skip: parse_or::<u32>("BROADCAST_SKIP", 1)?.max(1),
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),
            game,
            sender_pool_size: parse_or::<usize>("SENDER_POOL_SIZE", 4)?.max(1),
            session_queue_capacity: parse_or::<usize>("SESSION_QUEUE_CAPACITY", 64)?.max(1),
            input_rate_limit: parse_or("INPUT_RATE_LIMIT", 60)?,
            sweep_interval: Duration::from_secs(parse_or("SWEEP_INTERVAL_SECS", 60)?),
            lobby_timeout: Duration::from_secs(parse_or("LOBBY_TIMEOUT_SECS", 120)?),
            ingame_timeout: Duration::from_secs(parse_or("INGAME_TIMEOUT_SECS", 120)?),
            position_log_enabled: parse_or("POSITION_LOG_ENABLED", true)?,
            position_log_capacity: parse_or::<usize>("POSITION_LOG_CAPACITY", 8192)?.max(1),
            position_log_path: env::var("POSITION_LOG_PATH").ok().map(PathBuf::from),
            practice_seed: match env::var("PRACTICE_SEED") {
                Ok(raw) => Some(raw.parse().map_err(|_| ConfigError::Invalid("PRACTICE_SEED"))?),
                Err(_) => None,
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            client_origin: "*".to_string(),
            game: GameConfig::default(),
            sender_pool_size: 4,
            session_queue_capacity: 64,
            input_rate_limit: 60,
            sweep_interval: Duration::from_secs(60),
            lobby_timeout: Duration::from_secs(120),
            ingame_timeout: Duration::from_secs(120),
            position_log_enabled: true,
            position_log_capacity: 8192,
            position_log_path: None,
            practice_seed: None,
        }
    }
}

/// Read an optional variable, falling back to `default` when unset
fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.game.countdown_secs, 5);
        assert_eq!(config.game.round_secs, 180);
        assert_eq!(config.sender_pool_size, 4);
        assert_eq!(config.lobby_timeout, Duration::from_secs(120));
        assert_eq!(config.ingame_timeout, Duration::from_secs(120));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn unset_key_uses_fallback() {
        let value: u64 = parse_or("CAR_SOCCER_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }
}
