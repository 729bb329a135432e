//! Archipelago client commands and login strings.
//!
//! Archipelago frames are always arrays of commands, each tagged by `cmd`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Receive items from every world, including our own and starting inventory.
pub const ITEMS_HANDLING_ALL: u8 = 0b111;

/// Tags announced by a text-only client.
pub const DEFAULT_TAGS: [&str; 2] = ["AP", "TextOnly"];

/// `ConnectionRefused` errors that no amount of retrying will fix.
pub const FATAL_REFUSALS: [&str; 5] = [
    "InvalidSlot",
    "InvalidGame",
    "InvalidPassword",
    "IncompatibleVersion",
    "InvalidItemsHandling",
];

/// Data storage key read by the keepalive `Get`.
pub const KEEPALIVE_KEY: &str = "_read_race_mode";

/// Protocol version announced in `Connect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    #[serde(default = "NetworkVersion::class_name")]
    pub class: String,
}

impl NetworkVersion {
    pub fn new(major: u32, minor: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            build,
            class: Self::class_name(),
        }
    }

    fn class_name() -> String {
        "Version".to_string()
    }
}

impl Default for NetworkVersion {
    fn default() -> Self {
        Self::new(0, 4, 4)
    }
}

/// Body of the `Connect` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub password: String,
    pub name: String,
    pub version: NetworkVersion,
    pub tags: Vec<String>,
    pub items_handling: u8,
    pub uuid: String,
    pub game: String,
    pub slot_data: bool,
}

/// Commands sent from the client to an Archipelago server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum ClientCommand {
    /// Join the room as a slot
    Connect(ConnectRequest),
    /// Chat message to the room
    Say { text: String },
    /// Report locations checked by the player
    LocationChecks { locations: Vec<i64> },
    /// Read data storage keys, answered by `Retrieved`
    Get { keys: Vec<String> },
}

impl ClientCommand {
    pub fn say(text: impl Into<String>) -> Self {
        Self::Say { text: text.into() }
    }

    pub fn location_checks(locations: impl IntoIterator<Item = i64>) -> Self {
        Self::LocationChecks {
            locations: locations.into_iter().collect(),
        }
    }

    /// Cheap read used as an application-level keepalive.
    pub fn keepalive() -> Self {
        Self::Get {
            keys: vec![KEEPALIVE_KEY.to_string()],
        }
    }
}

/// Wrap commands into the array frame the server expects.
pub fn encode_commands(commands: &[ClientCommand]) -> serde_json::Value {
    // Serializing derive-only structs of strings and integers cannot fail
    serde_json::to_value(commands).unwrap_or_default()
}

/// Errors parsing a `name:password@host:port` login string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialsError {
    #[error("Login string is missing '@server'")]
    MissingServer,
    #[error("Login string is missing the slot name")]
    MissingName,
    #[error("Invalid server address '{0}'")]
    InvalidServer(String),
}

/// Parsed Archipelago login string: `name[:password]@host:port`
#[derive(Clone, PartialEq, Eq)]
pub struct ArchipelagoCredentials {
    pub name: String,
    pub password: String,
    pub server: String,
}

impl ArchipelagoCredentials {
    /// URLs to try, in order, for each connection attempt.
    ///
    /// Bare `host:port` tries TLS first and falls back to plain websockets.
    pub fn candidate_urls(&self) -> Vec<String> {
        if self.server.starts_with("ws://") || self.server.starts_with("wss://") {
            vec![self.server.clone()]
        } else {
            vec![format!("wss://{}", self.server), format!("ws://{}", self.server)]
        }
    }

    /// Identity safe to log and to key a registry with (no password).
    pub fn identity(&self) -> String {
        format!("archipelago:{}@{}", self.name, self.server)
    }
}

impl fmt::Debug for ArchipelagoCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchipelagoCredentials")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .field("server", &self.server)
            .finish()
    }
}

impl FromStr for ArchipelagoCredentials {
    type Err = CredentialsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (login, server) = s
            .trim()
            .rsplit_once('@')
            .ok_or(CredentialsError::MissingServer)?;

        let (name, password) = login.split_once(':').unwrap_or((login, ""));
        if name.is_empty() {
            return Err(CredentialsError::MissingName);
        }

        let server = server.trim();
        let probe = if server.contains("://") {
            server.to_string()
        } else {
            format!("ws://{server}")
        };
        match url::Url::parse(&probe) {
            Ok(parsed) if parsed.host_str().is_some_and(|h| !h.is_empty()) => {}
            _ => return Err(CredentialsError::InvalidServer(server.to_string())),
        }

        Ok(Self {
            name: name.to_string(),
            password: password.to_string(),
            server: server.to_string(),
        })
    }
}
