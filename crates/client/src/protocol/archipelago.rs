//! Archipelago multiworld sessions.
//!
//! The server speaks first: `RoomInfo` plays the role of the handshake ack, the
//! `Connect` command is the subscribe request and `Connected` accepts it.

use modlink_protocol::{
    encode_commands, ArchipelagoCredentials, ClientCommand, ConnectRequest, JsonObject,
    NetworkVersion, DEFAULT_TAGS, FATAL_REFUSALS, ITEMS_HANDLING_ALL, KEEPALIVE_KEY,
};
use serde_json::Value;

use super::{Inbound, SessionProtocol, SubscribeAck};

#[derive(Debug, Clone)]
pub struct ArchipelagoProtocol {
    credentials: ArchipelagoCredentials,
    game: String,
    uuid: String,
    version: NetworkVersion,
    tags: Vec<String>,
}

impl ArchipelagoProtocol {
    pub fn new(credentials: ArchipelagoCredentials, game: impl Into<String>) -> Self {
        Self {
            credentials,
            game: game.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
            version: NetworkVersion::default(),
            tags: DEFAULT_TAGS.iter().map(|tag| tag.to_string()).collect(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn credentials(&self) -> &ArchipelagoCredentials {
        &self.credentials
    }

    /// Only the answer to our own keepalive `Get` counts as a pong.
    fn is_keepalive_reply(frame: &JsonObject) -> bool {
        frame
            .get("keys")
            .and_then(Value::as_object)
            .is_some_and(|keys| keys.contains_key(KEEPALIVE_KEY))
    }

    fn refusal(frame: &JsonObject) -> SubscribeAck {
        let errors: Vec<String> = frame
            .get("errors")
            .and_then(Value::as_array)
            .map(|errors| {
                errors
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if errors.is_empty() {
            return SubscribeAck::Rejected("ConnectionRefused".to_string());
        }
        let reason = errors.join(", ");
        if errors.iter().any(|e| FATAL_REFUSALS.contains(&e.as_str())) {
            SubscribeAck::AuthRejected(reason)
        } else {
            SubscribeAck::Rejected(reason)
        }
    }
}

impl SessionProtocol for ArchipelagoProtocol {
    fn name(&self) -> &'static str {
        "archipelago"
    }

    fn urls(&self) -> Vec<String> {
        self.credentials.candidate_urls()
    }

    fn handshake(&self) -> Option<Value> {
        None
    }

    fn subscribe(&mut self) -> Value {
        encode_commands(&[ClientCommand::Connect(ConnectRequest {
            password: self.credentials.password.clone(),
            name: self.credentials.name.clone(),
            version: self.version.clone(),
            tags: self.tags.clone(),
            items_handling: ITEMS_HANDLING_ALL,
            uuid: self.uuid.clone(),
            game: self.game.clone(),
            slot_data: false,
        })])
    }

    fn ping(&self) -> Value {
        encode_commands(&[ClientCommand::keepalive()])
    }

    fn classify(&self, kind: &str, frame: JsonObject) -> Inbound {
        match kind {
            "ROOMINFO" => Inbound::HandshakeAck,
            "RETRIEVED" if Self::is_keepalive_reply(&frame) => Inbound::Pong,
            "CONNECTED" => Inbound::Subscribe(SubscribeAck::Accepted(Some(Value::Object(frame)))),
            "CONNECTIONREFUSED" => Inbound::Subscribe(Self::refusal(&frame)),
            _ => Inbound::Payload(Value::Object(frame)),
        }
    }
}
