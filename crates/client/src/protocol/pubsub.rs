//! Twitch PubSub sessions: one topic per connection.

use modlink_protocol::{format_topic, JsonObject, PubSubRequest, ResponseErrorKind, PUBSUB_URL};
use serde_json::{json, Value};

use super::{Inbound, SessionProtocol, SubscribeAck};

/// Credentials for LISTEN requests.
#[derive(Clone, PartialEq, Eq)]
pub struct PubSubAuth {
    pub token: String,
    /// Substituted for `{UserID}` in topic templates
    pub user_id: Option<String>,
}

impl std::fmt::Debug for PubSubAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubAuth")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PubSubProtocol {
    topic: String,
    auth: PubSubAuth,
    url: String,
}

impl PubSubProtocol {
    pub fn new(topic: impl Into<String>, auth: PubSubAuth) -> Self {
        Self {
            topic: topic.into(),
            auth,
            url: PUBSUB_URL.to_string(),
        }
    }

    /// Point the session at another server, e.g. a local mock.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Topic with the user id substituted.
    pub fn topic(&self) -> String {
        format_topic(&self.topic, self.auth.user_id.as_deref())
    }

    fn payload(&self, kind: &str, mut frame: JsonObject) -> Inbound {
        let Some(data) = frame.remove("data") else {
            return Inbound::Ignored(format!("{kind} frame without data"));
        };
        if kind != "MESSAGE" {
            return Inbound::Payload(data);
        }
        // MESSAGE nests the event as a JSON string under data.message
        let topic = data.get("topic").cloned().unwrap_or_else(|| json!(self.topic()));
        let message = match data.get("message") {
            Some(Value::String(raw)) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
            Some(other) => other.clone(),
            None => Value::Null,
        };
        Inbound::Payload(json!({ "topic": topic, "message": message }))
    }
}

impl SessionProtocol for PubSubProtocol {
    fn name(&self) -> &'static str {
        "pubsub"
    }

    fn urls(&self) -> Vec<String> {
        vec![self.url.clone()]
    }

    fn handshake(&self) -> Option<Value> {
        Some(PubSubRequest::Ping.to_value())
    }

    fn subscribe(&mut self) -> Value {
        PubSubRequest::listen(self.topic(), self.auth.token.clone()).to_value()
    }

    fn ping(&self) -> Value {
        PubSubRequest::Ping.to_value()
    }

    fn classify(&self, kind: &str, frame: JsonObject) -> Inbound {
        match kind {
            "PONG" => Inbound::Pong,
            "RECONNECT" => Inbound::ReconnectRequested,
            "RESPONSE" => {
                let error = frame.get("error").and_then(Value::as_str);
                Inbound::Subscribe(match ResponseErrorKind::parse(error) {
                    ResponseErrorKind::None => SubscribeAck::Accepted(None),
                    ResponseErrorKind::BadAuth => SubscribeAck::AuthRejected("ERR_BADAUTH".into()),
                    ResponseErrorKind::Server => SubscribeAck::ServerError("ERR_SERVER".into()),
                    ResponseErrorKind::Other(error) => SubscribeAck::Rejected(error),
                })
            }
            _ => self.payload(kind, frame),
        }
    }
}
