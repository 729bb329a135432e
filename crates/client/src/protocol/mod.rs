//! Session protocols.
//!
//! A [`SessionProtocol`] supplies the frames a connection sends at each step of its
//! state machine and classifies every inbound frame into an [`Inbound`] event. The
//! connection owns all timing and state; protocols are pure frame logic.

mod archipelago;
mod pubsub;

pub use archipelago::ArchipelagoProtocol;
pub use pubsub::{PubSubAuth, PubSubProtocol};

use std::time::Duration;

use modlink_protocol::JsonObject;
use rand::Rng;
use serde_json::Value;

use crate::config::SessionConfig;

/// Answer to a subscribe request.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeAck {
    /// Subscribed; optionally carries a frame worth forwarding to the router
    Accepted(Option<Value>),
    /// The server refused our credentials; never retried
    AuthRejected(String),
    /// Transient server failure; the subscribe request is sent again
    ServerError(String),
    /// Any other refusal; never retried
    Rejected(String),
}

/// One classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The server confirmed a fresh socket is live
    HandshakeAck,
    /// Answer to a keepalive ping
    Pong,
    Subscribe(SubscribeAck),
    /// The server asked us to reconnect
    ReconnectRequested,
    /// Application payload for the router
    Payload(Value),
    /// Nothing to do; carries a reason for the log
    Ignored(String),
}

/// Frame logic for one kind of remote service.
pub trait SessionProtocol: Send {
    /// Short name used in log fields.
    fn name(&self) -> &'static str;

    /// URLs to try, in order, on every connect attempt.
    fn urls(&self) -> Vec<String>;

    /// Frame sent right after the socket opens, if the client speaks first.
    fn handshake(&self) -> Option<Value>;

    /// Subscribe request. Called again for every resend.
    fn subscribe(&mut self) -> Value;

    /// Keepalive ping sent while connected.
    fn ping(&self) -> Value;

    /// Delay until the next keepalive ping.
    fn next_ping_delay(&self, config: &SessionConfig) -> Duration {
        jittered(config.ping_interval, config.ping_jitter)
    }

    /// Classify one decoded frame. `kind` is the upper-cased discriminator.
    fn classify(&self, kind: &str, frame: JsonObject) -> Inbound;
}

/// `base` plus a uniform random delay in `[0, jitter)`.
pub(crate) fn jittered(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    base + jitter.mul_f64(rand::thread_rng().gen::<f64>())
}
