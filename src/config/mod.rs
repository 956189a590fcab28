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
    /// Allowed client origins for CORS, `*` for any
    pub client_origin: String,

    /// Where the weekly rating ledger is persisted
    pub rating_store_path: PathBuf,

    /// Engine timings
    pub engine: EngineConfig,
    /// Elo parameters
    pub rating: RatingConfig,
}

/// Timing knobs for match sessions
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// How long the active side has to make a move
    pub turn_timeout: Duration,
    /// How long a rematch offer stays answerable
    pub rematch_window: Duration,
    /// How long a session with nobody connected survives
    pub session_idle: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            turn_timeout: Duration::from_secs(20),
            rematch_window: Duration::from_secs(30),
            session_idle: Duration::from_secs(300),
        }
    }
}

/// Weekly rating parameters
#[derive(Clone, Copy, Debug)]
pub struct RatingConfig {
    pub default_rating: i32,
    pub k_factor: f64,
    pub min_delta: i32,
    pub max_delta: i32,
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self {
            default_rating: 1000,
            k_factor: 32.0,
            min_delta: 1,
            max_delta: 40,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // PORT takes precedence for hosted deployments
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let engine_defaults = EngineConfig::default();
        let rating_defaults = RatingConfig::default();

        let engine = EngineConfig {
            turn_timeout: Duration::from_secs(parse_or(
                "TURN_TIMEOUT_SECS",
                engine_defaults.turn_timeout.as_secs(),
            )?),
            rematch_window: Duration::from_secs(parse_or(
                "REMATCH_WINDOW_SECS",
                engine_defaults.rematch_window.as_secs(),
            )?),
            session_idle: Duration::from_secs(parse_or(
                "SESSION_IDLE_SECS",
                engine_defaults.session_idle.as_secs(),
            )?),
        };

        let rating = RatingConfig {
            default_rating: parse_or("RATING_DEFAULT", rating_defaults.default_rating)?,
            k_factor: parse_or("RATING_K_FACTOR", rating_defaults.k_factor)?,
            min_delta: parse_or("RATING_MIN_DELTA", rating_defaults.min_delta)?,
            max_delta: parse_or("RATING_MAX_DELTA", rating_defaults.max_delta)?,
        };

        if rating.min_delta > rating.max_delta {
            return Err(ConfigError::Invalid("RATING_MIN_DELTA"));
        }

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),

            rating_store_path: env::var("RATING_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/weekly_ratings.json")),

            engine,
            rating,
        })
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
