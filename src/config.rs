use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub api_base_url: String,
    pub ws_url: String,
    pub auth_token: Option<String>,
    pub event_buffer_size: usize,
    pub command_buffer_size: usize,
    pub sync: SyncConfig,
}

/// Timing knobs for the synchronization engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub reconnect_max_attempts: u32,
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(30_000),
            poll_interval: Duration::from_millis(15_000),
            reconnect_base: Duration::from_millis(1_000),
            reconnect_cap: Duration::from_millis(30_000),
            reconnect_max_attempts: 5,
            request_timeout: Duration::from_millis(10_000),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let defaults = SyncConfig::default();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            api_base_url: env::var("API_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            ws_url: env::var("WS_URL")
                .unwrap_or_else(|_| "ws://localhost:8000/ws/driver/".to_string()),
            auth_token: env::var("AUTH_TOKEN").ok().filter(|token| !token.is_empty()),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            command_buffer_size: parse_or_default("COMMAND_BUFFER_SIZE", 256)?,
            sync: SyncConfig {
                heartbeat_interval: millis_or_default(
                    "HEARTBEAT_INTERVAL_MS",
                    defaults.heartbeat_interval,
                )?,
                poll_interval: millis_or_default("POLL_INTERVAL_MS", defaults.poll_interval)?,
                reconnect_base: millis_or_default("RECONNECT_BASE_MS", defaults.reconnect_base)?,
                reconnect_cap: millis_or_default("RECONNECT_CAP_MS", defaults.reconnect_cap)?,
                reconnect_max_attempts: parse_or_default(
                    "RECONNECT_MAX_ATTEMPTS",
                    defaults.reconnect_max_attempts,
                )?,
                request_timeout: millis_or_default(
                    "REQUEST_TIMEOUT_MS",
                    defaults.request_timeout,
                )?,
            },
        })
    }
}

fn millis_or_default(key: &str, default: Duration) -> Result<Duration, AppError> {
    let millis: u64 = parse_or_default(key, default.as_millis() as u64)?;
    if millis == 0 {
        return Err(AppError::Internal(format!("invalid {key}: must be > 0")));
    }
    Ok(Duration::from_millis(millis))
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
