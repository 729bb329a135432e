//! Session configuration

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Tunables for every connection owned by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Upper bound on one readiness wait of the poll loop
    pub poll_wait: Duration,
    /// How long a fresh socket may take to answer the handshake or subscribe request
    pub handshake_timeout: Duration,
    /// How long a keepalive ping may go unanswered
    pub ping_timeout: Duration,
    /// How long a single connect attempt may take
    pub connect_timeout: Duration,
    /// Base interval between keepalive pings
    pub ping_interval: Duration,
    /// Random extra delay added to each ping interval
    pub ping_jitter: Duration,
    /// Backoff exponent cap: retry delays top out at 2^cap seconds plus jitter.
    /// The default of 7 gives the ≈128s ceiling; the attempt counter stops there too.
    pub max_backoff_exponent: u32,
    /// Frames read from one socket per poll cycle before moving on
    pub max_frames_per_cycle: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_wait: Duration::from_millis(250),
            handshake_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            // Twitch asks for a PING at least every 5 minutes, jittered to spread load
            ping_interval: Duration::from_secs(240),
            ping_jitter: Duration::from_secs(30),
            max_backoff_exponent: 7,
            max_frames_per_cycle: 64,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

impl SessionConfig {
    /// Load configuration from `MODLINK_*` environment variables, defaulting each one.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            poll_wait: Duration::from_millis(env_or(
                "MODLINK_POLL_WAIT_MS",
                defaults.poll_wait.as_millis() as u64,
            )?),
            handshake_timeout: Duration::from_secs(env_or(
                "MODLINK_HANDSHAKE_TIMEOUT_SECS",
                defaults.handshake_timeout.as_secs(),
            )?),
            ping_timeout: Duration::from_secs(env_or(
                "MODLINK_PING_TIMEOUT_SECS",
                defaults.ping_timeout.as_secs(),
            )?),
            connect_timeout: Duration::from_secs(env_or(
                "MODLINK_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )?),
            ping_interval: Duration::from_secs(env_or(
                "MODLINK_PING_INTERVAL_SECS",
                defaults.ping_interval.as_secs(),
            )?),
            ping_jitter: Duration::from_secs(env_or(
                "MODLINK_PING_JITTER_SECS",
                defaults.ping_jitter.as_secs(),
            )?),
            max_backoff_exponent: env_or(
                "MODLINK_MAX_BACKOFF_EXPONENT",
                defaults.max_backoff_exponent,
            )?,
            max_frames_per_cycle: env_or(
                "MODLINK_MAX_FRAMES_PER_CYCLE",
                defaults.max_frames_per_cycle,
            )?,
        })
    }
}
