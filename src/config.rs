//! Client configuration: endpoints, tick cadence, backoff and staleness limits.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};
use validator::Validate;

/// Default location on disk where the client looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/contest-sync.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "CONTEST_SYNC_CONFIG_PATH";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";
const DEFAULT_CHANNEL_BASE_URL: &str = "ws://localhost:8080";

/// Immutable runtime configuration shared by every component of a contest session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the REST API (`GET /contests/{id}` etc).
    pub api_base_url: String,
    /// Base URL of the real-time channel.
    pub channel_base_url: String,
    /// Cadence of the countdown timers.
    pub tick_interval: Duration,
    /// Weight given to a fresh clock offset candidate.
    pub smoothing_factor: f64,
    /// First reconnect delay.
    pub backoff_initial: Duration,
    /// Ceiling for reconnect delays.
    pub backoff_max: Duration,
    /// Consecutive failed attempts tolerated before the channel closes for good.
    pub max_reconnect_attempts: u32,
    /// Upper bound for the snapshot + server time exchange after connecting.
    pub resync_timeout: Duration,
    /// Age after which the clock offset is flagged as possibly inaccurate.
    pub clock_stale_after: Duration,
    /// Malformed messages tolerated on a single connection.
    pub malformed_message_threshold: u32,
    /// Refresh cadence of the polling fallback.
    pub poll_interval: Duration,
    /// Capacity of the per-contest event bus.
    pub event_capacity: usize,
    /// How long before the start the live channel is opened.
    pub live_window: Duration,
}

impl SyncConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json_str(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded contest sync config");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse and validate a JSON configuration document. Missing keys keep their defaults.
    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let raw = serde_json::from_str::<RawConfig>(contents)?;
        raw.validate()?;
        Ok(raw.into())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.into(),
            channel_base_url: DEFAULT_CHANNEL_BASE_URL.into(),
            tick_interval: Duration::from_millis(1_000),
            smoothing_factor: 0.3,
            backoff_initial: Duration::from_millis(1_000),
            backoff_max: Duration::from_secs(30),
            max_reconnect_attempts: 8,
            resync_timeout: Duration::from_secs(5),
            clock_stale_after: Duration::from_secs(60),
            malformed_message_threshold: 5,
            poll_interval: Duration::from_secs(5),
            event_capacity: 64,
            live_window: Duration::from_secs(600),
        }
    }
}

/// Reasons a configuration document is refused.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The document is not valid JSON for [`RawConfig`].
    #[error("invalid config document")]
    Parse(#[from] serde_json::Error),
    /// A value is out of its allowed range.
    #[error("invalid config value: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    #[validate(length(min = 1))]
    api_base_url: Option<String>,
    #[validate(length(min = 1))]
    channel_base_url: Option<String>,
    #[validate(range(min = 50, max = 60_000))]
    tick_interval_ms: Option<u64>,
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    smoothing_factor: Option<f64>,
    #[validate(range(min = 1))]
    backoff_initial_ms: Option<u64>,
    #[validate(range(min = 1))]
    backoff_max_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    #[validate(range(min = 1))]
    resync_timeout_ms: Option<u64>,
    #[validate(range(min = 1))]
    clock_stale_after_ms: Option<u64>,
    #[validate(range(min = 1))]
    malformed_message_threshold: Option<u32>,
    #[validate(range(min = 100))]
    poll_interval_ms: Option<u64>,
    #[validate(range(min = 1))]
    event_capacity: Option<usize>,
    live_window_ms: Option<u64>,
}

impl From<RawConfig> for SyncConfig {
    fn from(raw: RawConfig) -> Self {
        let defaults = SyncConfig::default();
        let millis = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        let backoff_initial = millis(raw.backoff_initial_ms, defaults.backoff_initial);
        Self {
            api_base_url: raw.api_base_url.unwrap_or(defaults.api_base_url),
            channel_base_url: raw.channel_base_url.unwrap_or(defaults.channel_base_url),
            tick_interval: millis(raw.tick_interval_ms, defaults.tick_interval),
            smoothing_factor: raw.smoothing_factor.unwrap_or(defaults.smoothing_factor),
            backoff_initial,
            backoff_max: millis(raw.backoff_max_ms, defaults.backoff_max).max(backoff_initial),
            max_reconnect_attempts: raw
                .max_reconnect_attempts
                .unwrap_or(defaults.max_reconnect_attempts),
            resync_timeout: millis(raw.resync_timeout_ms, defaults.resync_timeout),
            clock_stale_after: millis(raw.clock_stale_after_ms, defaults.clock_stale_after),
            malformed_message_threshold: raw
                .malformed_message_threshold
                .unwrap_or(defaults.malformed_message_threshold),
            poll_interval: millis(raw.poll_interval_ms, defaults.poll_interval),
            event_capacity: raw.event_capacity.unwrap_or(defaults.event_capacity),
            live_window: millis(raw.live_window_ms, defaults.live_window),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
