//! Twitch PubSub request frames.

use serde::{Deserialize, Serialize};

/// Edge endpoint every PubSub topic connects to.
pub const PUBSUB_URL: &str = "wss://pubsub-edge.twitch.tv";

/// Placeholder in topic templates replaced by the authenticated user's id.
pub const USER_ID_PLACEHOLDER: &str = "{UserID}";

/// Requests sent from the client to PubSub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum PubSubRequest {
    /// Keepalive, answered by PONG
    Ping,
    /// Subscribe to one or more topics
    Listen { nonce: String, data: ListenData },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenData {
    pub topics: Vec<String>,
    pub auth_token: String,
}

impl PubSubRequest {
    /// LISTEN for a single topic with a fresh nonce.
    pub fn listen(topic: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self::Listen {
            nonce: uuid::Uuid::new_v4().to_string(),
            data: ListenData {
                topics: vec![topic.into()],
                auth_token: auth_token.into(),
            },
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        // Serializing a derive-only enum of strings cannot fail
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Substitute `{UserID}` in a topic template.
pub fn format_topic(template: &str, user_id: Option<&str>) -> String {
    match user_id {
        Some(id) => template.replace(USER_ID_PLACEHOLDER, id),
        None => template.to_string(),
    }
}

/// Classification of the `error` field of a RESPONSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseErrorKind {
    /// Empty error: the request succeeded
    None,
    /// ERR_BADAUTH: token lacks the scope for the topic
    BadAuth,
    /// ERR_SERVER: transient failure on Twitch's side
    Server,
    /// Anything else; the topic itself is unusable
    Other(String),
}

impl ResponseErrorKind {
    pub fn parse(error: Option<&str>) -> Self {
        let error = error.map(str::trim).unwrap_or_default().to_uppercase();
        match error.as_str() {
            "" => Self::None,
            "ERR_BADAUTH" => Self::BadAuth,
            "ERR_SERVER" => Self::Server,
            _ => Self::Other(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ping_wire_format() {
        assert_eq!(PubSubRequest::Ping.to_value(), json!({"type": "PING"}));
    }

    #[test]
    fn test_listen_wire_format() {
        let value = PubSubRequest::listen("channel-points-channel-v1.42", "tok").to_value();
        assert_eq!(value["type"], "LISTEN");
        assert_eq!(value["data"]["topics"], json!(["channel-points-channel-v1.42"]));
        assert_eq!(value["data"]["auth_token"], "tok");
        assert!(value["nonce"].as_str().is_some_and(|n| !n.is_empty()));
    }

    #[test]
    fn test_only_ping_and_listen_are_requests() {
        let unlisten = json!({
            "type": "UNLISTEN",
            "nonce": "n",
            "data": {"topics": ["whispers.42"], "auth_token": "tok"}
        });
        assert!(serde_json::from_value::<PubSubRequest>(unlisten).is_err());
        assert_eq!(
            serde_json::from_value::<PubSubRequest>(json!({"type": "PING"})).ok(),
            Some(PubSubRequest::Ping)
        );
    }

    #[test]
    fn test_format_topic() {
        assert_eq!(
            format_topic("channel-points-channel-v1.{UserID}", Some("1234")),
            "channel-points-channel-v1.1234"
        );
        assert_eq!(format_topic("whispers.{UserID}", None), "whispers.{UserID}");
    }

    #[test]
    fn test_response_error_kinds() {
        assert_eq!(ResponseErrorKind::parse(None), ResponseErrorKind::None);
        assert_eq!(ResponseErrorKind::parse(Some("")), ResponseErrorKind::None);
        assert_eq!(
            ResponseErrorKind::parse(Some("err_badauth")),
            ResponseErrorKind::BadAuth
        );
        assert_eq!(
            ResponseErrorKind::parse(Some("ERR_SERVER")),
            ResponseErrorKind::Server
        );
        assert_eq!(
            ResponseErrorKind::parse(Some("ERR_BADTOPIC")),
            ResponseErrorKind::Other("ERR_BADTOPIC".to_string())
        );
    }
}
