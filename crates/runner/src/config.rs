//! Runner configuration

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use modlink_client::SessionConfig;
use modlink_protocol::ArchipelagoCredentials;

#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub token: String,
    pub user_id: Option<String>,
    /// Topic templates, possibly containing `{UserID}`
    pub topics: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ArchipelagoConfig {
    pub credentials: ArchipelagoCredentials,
    pub game: String,
    /// Chat line sent once the slot is connected
    pub greeting: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub session: SessionConfig,
    pub pubsub: Option<PubSubConfig>,
    pub archipelago: Option<ArchipelagoConfig>,
    /// How often the simulated host drains the dispatch queue
    pub tick_interval: Duration,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl RunnerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let session = SessionConfig::from_env()?;
        Self::from_lookup(session, |key| env::var(key).ok())
    }

    /// Build from any key lookup; endpoints are optional but at least one is required.
    pub fn from_lookup(session: SessionConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let pubsub = match non_empty(lookup("MODLINK_PUBSUB_TOKEN")) {
            Some(token) => {
                let topics = non_empty(lookup("MODLINK_PUBSUB_TOPICS"))
                    .map(|raw| split_list(&raw))
                    .filter(|topics| !topics.is_empty())
                    .context("MODLINK_PUBSUB_TOPICS is required when MODLINK_PUBSUB_TOKEN is set")?;
                Some(PubSubConfig {
                    token,
                    user_id: non_empty(lookup("MODLINK_PUBSUB_USER_ID")),
                    topics,
                })
            }
            None => None,
        };

        let archipelago = match non_empty(lookup("MODLINK_ARCHIPELAGO_LOGIN")) {
            Some(login) => Some(ArchipelagoConfig {
                credentials: login
                    .parse::<ArchipelagoCredentials>()
                    .context("MODLINK_ARCHIPELAGO_LOGIN must look like name:password@host:port")?,
                game: lookup("MODLINK_ARCHIPELAGO_GAME").unwrap_or_default(),
                greeting: non_empty(lookup("MODLINK_ARCHIPELAGO_GREETING")),
            }),
            None => None,
        };

        if pubsub.is_none() && archipelago.is_none() {
            anyhow::bail!(
                "No endpoints configured: set MODLINK_PUBSUB_TOKEN and MODLINK_PUBSUB_TOPICS, \
                 or MODLINK_ARCHIPELAGO_LOGIN"
            );
        }

        let tick_ms: u64 = lookup("MODLINK_TICK_MS")
            .unwrap_or_else(|| "16".to_string())
            .trim()
            .parse()
            .context("MODLINK_TICK_MS must be a valid number of milliseconds")?;

        Ok(Self {
            session,
            pubsub,
            archipelago,
            tick_interval: Duration::from_millis(tick_ms.max(1)),
        })
    }
}
