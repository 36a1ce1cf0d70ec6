use std::str::FromStr;
use std::time::Duration;

use easel_core::error::CoreError;

use crate::manager::ChannelConfig;
use crate::reconnect::ReconnectConfig;
use crate::retry::RetryConfig;

/// Engine connection configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local ComfyUI instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine base URL (default: `http://127.0.0.1:8188`).
    pub base_url: String,
    /// Per-request REST timeout (default: 30s).
    pub request_timeout: Duration,
    /// Deadline for one job, push or poll (default: 120s).
    pub job_timeout: Duration,
    /// Interval between history polls (default: 2000ms).
    pub poll_interval: Duration,
    /// Total attempts per job (default: 3).
    pub max_retries: u32,
    /// Observe jobs over the WebSocket channel when progress is wanted (default: true).
    pub use_websocket: bool,
    /// WebSocket handshake timeout (default: 10s).
    pub connect_timeout: Duration,
    /// Fixed wait before each reconnect attempt (default: 5s).
    pub reconnect_delay: Duration,
    /// Reconnect attempts after a drop (default: 3).
    pub max_reconnect_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8188".into(),
            request_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(2_000),
            max_retries: 3,
            use_websocket: true,
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 3,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                          | Default                 |
    /// |----------------------------------|-------------------------|
    /// | `COMFYUI_URL`                    | `http://127.0.0.1:8188` |
    /// | `COMFYUI_REQUEST_TIMEOUT_SECS`   | `30`                    |
    /// | `COMFYUI_JOB_TIMEOUT_SECS`       | `120`                   |
    /// | `COMFYUI_POLL_INTERVAL_MS`       | `2000`                  |
    /// | `COMFYUI_MAX_RETRIES`            | `3`                     |
    /// | `COMFYUI_USE_WEBSOCKET`          | `true`                  |
    /// | `COMFYUI_CONNECT_TIMEOUT_SECS`   | `10`                    |
    /// | `COMFYUI_RECONNECT_DELAY_SECS`   | `5`                     |
    /// | `COMFYUI_MAX_RECONNECT_ATTEMPTS` | `3`                     |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let defaults = Self::default();

        let base_url = match lookup("COMFYUI_URL") {
            Some(url) if !url.trim().is_empty() => url.trim().trim_end_matches('/').to_string(),
            Some(_) => {
                return Err(CoreError::Validation("COMFYUI_URL must not be empty".into()));
            }
            None => defaults.base_url,
        };

        Ok(Self {
            base_url,
            request_timeout: secs(&lookup, "COMFYUI_REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            job_timeout: secs(&lookup, "COMFYUI_JOB_TIMEOUT_SECS", defaults.job_timeout)?,
            poll_interval: Duration::from_millis(parse(
                &lookup,
                "COMFYUI_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            max_retries: parse(&lookup, "COMFYUI_MAX_RETRIES", defaults.max_retries)?,
            use_websocket: flag(&lookup, "COMFYUI_USE_WEBSOCKET", defaults.use_websocket)?,
            connect_timeout: secs(&lookup, "COMFYUI_CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
            reconnect_delay: secs(&lookup, "COMFYUI_RECONNECT_DELAY_SECS", defaults.reconnect_delay)?,
            max_reconnect_attempts: parse(
                &lookup,
                "COMFYUI_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
        })
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            connect_timeout: self.connect_timeout,
            reconnect: ReconnectConfig {
                max_attempts: self.max_reconnect_attempts,
                delay: self.reconnect_delay,
            },
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            ..RetryConfig::default()
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, CoreError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CoreError::Validation(format!("{key} must be a non-negative integer, got {raw:?}"))),
        None => Ok(default),
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, CoreError> {
    parse(lookup, key, default.as_secs()).map(Duration::from_secs)
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool, CoreError> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CoreError::Validation(format!("{key} must be a boolean, got {raw:?}"))),
    }
}
