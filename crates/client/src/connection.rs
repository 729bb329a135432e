//! Per-endpoint session state machine.
//!
//! A [`Connection`] is owned by the poll thread. The thread feeds it readiness
//! ([`Connection::receive_message`]) and time ([`Connection::poll`]); the connection
//! answers with socket writes, timer updates and events for the dispatch queue. Every
//! failure becomes a state transition: nothing here returns an error to the caller.

use std::collections::VecDeque;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;

use modlink_protocol::{decode_frames, discriminator, encode, JsonObject};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffState;
use crate::config::SessionConfig;
use crate::endpoint::EndpointId;
use crate::error::TransportError;
use crate::handle::{set_connection_state, ConnectionHandle, ConnectionState, ConnectionStatus};
use crate::protocol::{Inbound, SessionProtocol, SubscribeAck};
use crate::router::EventSink;
use crate::transport::{Connector, Recv, Transport};

/// Result of one [`Connection::receive_message`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Nothing was buffered
    WouldBlock,
    /// One frame was read and handled
    Processed,
    /// The socket was replaced (or a retry scheduled); stop reading it this cycle
    Reconnected,
    /// The server refused the session for good; the connection is finished
    Rejected(String),
}

/// What handling one frame did to the session.
enum Step {
    Continue,
    Reconnected,
    Rejected(String),
}

fn due(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|at| now >= at)
}

pub struct Connection {
    id: EndpointId,
    protocol: Box<dyn SessionProtocol>,
    connector: Arc<dyn Connector>,
    config: Arc<SessionConfig>,
    state: ConnectionState,
    state_cell: Arc<AtomicU8>,
    transport: Option<Box<dyn Transport>>,
    backoff: BackoffState,
    next_reconnect_at: Option<Instant>,
    timeout_at: Option<Instant>,
    next_ping_at: Option<Instant>,
    sink: EventSink,
    outbound: mpsc::UnboundedReceiver<Value>,
    unsent: VecDeque<Value>,
    closed: CancellationToken,
    handle: ConnectionHandle,
    last_status: Option<ConnectionStatus>,
}

impl Connection {
    /// Create a disconnected connection whose first connect attempt is due now.
    pub fn new(
        id: EndpointId,
        protocol: Box<dyn SessionProtocol>,
        connector: Arc<dyn Connector>,
        config: Arc<SessionConfig>,
        sink: EventSink,
    ) -> Self {
        let state_cell = Arc::new(AtomicU8::new(ConnectionState::Disconnected.to_u8()));
        let (tx, outbound) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let handle = ConnectionHandle::new(id.clone(), Arc::clone(&state_cell), tx, closed.clone());
        let backoff = BackoffState::new(config.max_backoff_exponent);

        Self {
            id,
            protocol,
            connector,
            config,
            state: ConnectionState::Disconnected,
            state_cell,
            transport: None,
            backoff,
            next_reconnect_at: Some(Instant::now()),
            timeout_at: None,
            next_ping_at: None,
            sink,
            outbound,
            unsent: VecDeque::new(),
            closed,
            handle,
            last_status: None,
        }
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn has_socket(&self) -> bool {
        self.transport.is_some()
    }

    /// Closed by the host or rejected by the server.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn next_reconnect_at(&self) -> Option<Instant> {
        self.next_reconnect_at
    }

    pub fn timeout_at(&self) -> Option<Instant> {
        self.timeout_at
    }

    pub fn next_ping_at(&self) -> Option<Instant> {
        self.next_ping_at
    }

    pub fn backoff_attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(endpoint = %self.id, "State {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        set_connection_state(&self.state_cell, state);
    }

    fn publish(&mut self, status: ConnectionStatus) {
        if self.last_status.as_ref() == Some(&status) {
            return;
        }
        self.last_status = Some(status.clone());
        self.sink.publish_status(&self.id, status);
    }

    /// Resolves when the socket has something to read. Pending forever without a socket.
    pub async fn readable(&mut self) {
        match self.transport.as_mut() {
            Some(transport) => transport.readable().await,
            None => std::future::pending().await,
        }
    }

    async fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }

    async fn write(&mut self, frame: &Value) -> Result<(), TransportError> {
        let transport = self.transport.as_mut().ok_or(TransportError::Closed)?;
        let text = encode(frame).map_err(|e| TransportError::Send(e.to_string()))?;
        transport.send(text).await
    }

    /// Drop any socket and try every URL once. On failure schedule the next attempt.
    pub async fn reconnect(&mut self) {
        self.drop_transport().await;
        self.timeout_at = None;
        self.next_ping_at = None;
        self.set_state(ConnectionState::Connecting);
        self.publish(ConnectionStatus::Connecting);

        let Some(transport) = self.open_transport().await else {
            self.schedule_retry();
            return;
        };

        self.backoff.reset();
        self.next_reconnect_at = None;
        self.transport = Some(transport);

        if let Some(handshake) = self.protocol.handshake() {
            tracing::info!(endpoint = %self.id, "Connected, sending handshake");
            if let Err(e) = self.write(&handshake).await {
                tracing::warn!(endpoint = %self.id, "Failed to send handshake: {}", e);
                self.drop_transport().await;
                self.schedule_retry();
                return;
            }
        } else {
            tracing::info!(endpoint = %self.id, "Connected, waiting for server greeting");
        }
        self.set_state(ConnectionState::AwaitingHandshake);
        self.timeout_at = Some(Instant::now() + self.config.handshake_timeout);
    }

    async fn open_transport(&mut self) -> Option<Box<dyn Transport>> {
        for url in self.protocol.urls() {
            let attempt = tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&url));
            let result = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return None,
                result = attempt => result,
            };
            match result {
                Ok(Ok(transport)) => return Some(transport),
                Ok(Err(e)) => tracing::warn!(endpoint = %self.id, "{}", e),
                Err(_) => tracing::warn!(
                    endpoint = %self.id,
                    "{}",
                    TransportError::ConnectTimeout(url.clone())
                ),
            }
        }
        None
    }

    fn schedule_retry(&mut self) {
        let delay = self.backoff.record_failure();
        self.next_reconnect_at = Some(Instant::now() + delay);
        self.timeout_at = None;
        self.next_ping_at = None;
        self.set_state(ConnectionState::Disconnected);
        self.publish(ConnectionStatus::Disconnected);
        tracing::info!(
            endpoint = %self.id,
            attempts = self.backoff.attempts(),
            "Reconnecting in {:.1}s",
            delay.as_secs_f64()
        );
    }

    /// Read and handle at most one frame without blocking.
    pub async fn receive_message(&mut self) -> ReadOutcome {
        let Some(transport) = self.transport.as_mut() else {
            return ReadOutcome::WouldBlock;
        };
        let text = match transport.try_recv() {
            Recv::WouldBlock => return ReadOutcome::WouldBlock,
            Recv::Frame(text) => text,
            Recv::Closed(reason) => {
                tracing::warn!(
                    endpoint = %self.id,
                    "Socket closed ({}), reconnecting",
                    reason.as_deref().unwrap_or("no reason")
                );
                self.reconnect().await;
                return ReadOutcome::Reconnected;
            }
        };

        tracing::trace!(endpoint = %self.id, "Received {}", text);
        let frames = match decode_frames(&text) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::error!(endpoint = %self.id, "Dropping malformed frame: {}", e);
                return ReadOutcome::Processed;
            }
        };

        for frame in frames {
            match self.handle_frame(frame).await {
                Step::Continue => {}
                Step::Reconnected => return ReadOutcome::Reconnected,
                Step::Rejected(reason) => return ReadOutcome::Rejected(reason),
            }
        }
        ReadOutcome::Processed
    }

    async fn handle_frame(&mut self, frame: JsonObject) -> Step {
        let Some(kind) = discriminator(&frame) else {
            tracing::warn!(endpoint = %self.id, "Dropping frame without type or cmd");
            return Step::Continue;
        };
        let event = self.protocol.classify(&kind, frame);
        self.on_event(event, Instant::now()).await
    }

    async fn on_event(&mut self, event: Inbound, now: Instant) -> Step {
        use ConnectionState::*;

        match (self.state, event) {
            (AwaitingHandshake, Inbound::HandshakeAck) => {
                tracing::info!(endpoint = %self.id, "Handshake acknowledged, subscribing");
                self.send_subscribe(now).await
            }
            (AwaitingHandshake, Inbound::Pong) => {
                tracing::info!(endpoint = %self.id, "Received initial pong, subscribing");
                self.schedule_ping(now);
                self.send_subscribe(now).await
            }
            (Subscribing, Inbound::Pong) => {
                self.schedule_ping(now);
                Step::Continue
            }
            (Connected, Inbound::Pong) => {
                tracing::debug!(endpoint = %self.id, "Received keepalive pong");
                self.timeout_at = None;
                self.schedule_ping(now);
                Step::Continue
            }
            (Subscribing | Connected, Inbound::Subscribe(ack)) => self.on_subscribe_ack(ack, now).await,
            (_, Inbound::ReconnectRequested) => {
                tracing::warn!(endpoint = %self.id, "Server requested reconnect");
                self.reconnect().await;
                Step::Reconnected
            }
            (_, Inbound::Payload(payload)) => {
                self.sink.publish_payload(&self.id, payload);
                Step::Continue
            }
            (_, Inbound::Ignored(reason)) => {
                tracing::warn!(endpoint = %self.id, "Ignoring frame: {}", reason);
                Step::Continue
            }
            (state, event) => {
                tracing::warn!(
                    endpoint = %self.id,
                    "Unexpected {:?} while {:?}, reconnecting",
                    event,
                    state
                );
                self.reconnect().await;
                Step::Reconnected
            }
        }
    }

    async fn on_subscribe_ack(&mut self, ack: SubscribeAck, now: Instant) -> Step {
        match ack {
            SubscribeAck::Accepted(payload) => {
                tracing::info!(endpoint = %self.id, "Subscribed, connected");
                self.set_state(ConnectionState::Connected);
                self.timeout_at = None;
                self.schedule_ping(now);
                self.publish(ConnectionStatus::Connected);
                if let Some(payload) = payload {
                    self.sink.publish_payload(&self.id, payload);
                }
                Step::Continue
            }
            SubscribeAck::ServerError(reason) => {
                tracing::warn!(endpoint = %self.id, "Server error on subscribe ({}), retrying", reason);
                self.send_subscribe(now).await
            }
            SubscribeAck::AuthRejected(reason) => {
                tracing::error!(endpoint = %self.id, "Server rejected credentials: {}", reason);
                self.reject(reason).await
            }
            SubscribeAck::Rejected(reason) => {
                tracing::error!(endpoint = %self.id, "Server rejected subscription: {}", reason);
                self.reject(reason).await
            }
        }
    }

    async fn send_subscribe(&mut self, now: Instant) -> Step {
        let request = self.protocol.subscribe();
        if let Err(e) = self.write(&request).await {
            tracing::warn!(endpoint = %self.id, "Failed to send subscribe request: {}", e);
            self.reconnect().await;
            return Step::Reconnected;
        }
        self.set_state(ConnectionState::Subscribing);
        self.timeout_at = Some(now + self.config.handshake_timeout);
        Step::Continue
    }

    async fn reject(&mut self, reason: String) -> Step {
        self.drop_transport().await;
        self.clear_timers();
        self.set_state(ConnectionState::Disconnected);
        self.closed.cancel();
        self.publish(ConnectionStatus::Rejected(reason.clone()));
        Step::Rejected(reason)
    }

    fn schedule_ping(&mut self, now: Instant) {
        let delay = self.protocol.next_ping_delay(&self.config);
        self.next_ping_at = Some(now + delay);
        tracing::debug!(endpoint = %self.id, "Next ping in {:.1}s", delay.as_secs_f64());
    }

    fn clear_timers(&mut self) {
        self.next_reconnect_at = None;
        self.timeout_at = None;
        self.next_ping_at = None;
    }

    /// Run at most one timer action: reconnect, then timeout, then ping.
    pub async fn poll(&mut self, now: Instant) {
        if self.transport.is_none() && due(self.next_reconnect_at, now) {
            tracing::debug!(endpoint = %self.id, "Reconnect due");
            self.reconnect().await;
        } else if due(self.timeout_at, now) {
            tracing::warn!(endpoint = %self.id, "Timed out while {:?}, reconnecting", self.state);
            self.reconnect().await;
        } else if self.state == ConnectionState::Connected && due(self.next_ping_at, now) {
            self.send_ping(now).await;
        }
    }

    async fn send_ping(&mut self, now: Instant) {
        let ping = self.protocol.ping();
        if let Err(e) = self.write(&ping).await {
            tracing::warn!(endpoint = %self.id, "Failed to send ping: {}", e);
            self.reconnect().await;
            return;
        }
        tracing::debug!(endpoint = %self.id, "Sent keepalive ping");
        // Rescheduled when the pong arrives
        self.next_ping_at = None;
        self.timeout_at = Some(now + self.config.ping_timeout);
    }

    /// Write frames queued through the handle. They wait until the session is connected.
    ///
    /// Returns false if a write failed and the session was reconnected.
    pub async fn flush_outbound(&mut self) -> bool {
        while let Ok(frame) = self.outbound.try_recv() {
            self.unsent.push_back(frame);
        }
        if self.state != ConnectionState::Connected {
            return true;
        }
        while let Some(frame) = self.unsent.front().cloned() {
            if let Err(e) = self.write(&frame).await {
                tracing::warn!(endpoint = %self.id, "Failed to send queued frame: {}", e);
                self.reconnect().await;
                return false;
            }
            self.unsent.pop_front();
        }
        true
    }

    /// Close the socket and stop for good.
    pub async fn shutdown(&mut self) {
        tracing::info!(endpoint = %self.id, "Closing connection");
        self.drop_transport().await;
        self.clear_timers();
        self.set_state(ConnectionState::Disconnected);
        self.closed.cancel();
        self.publish(ConnectionStatus::Closed);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("protocol", &self.protocol.name())
            .field("state", &self.state)
            .field("has_socket", &self.has_socket())
            .field("attempts", &self.backoff.attempts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;

    use crate::dispatch::{DispatchQueue, MainThreadDrain};
    use crate::protocol::{ArchipelagoProtocol, PubSubAuth, PubSubProtocol};
    use crate::router::MessageRouter;
    use crate::testing::MockServer;

    const TOPIC: &str = "channel-points-channel-v1.1234";

    struct Harness {
        conn: Connection,
        drain: MainThreadDrain,
        statuses: Arc<Mutex<Vec<ConnectionStatus>>>,
        payloads: Arc<Mutex<Vec<Value>>>,
    }

    impl Harness {
        fn new(server: &MockServer, protocol: Box<dyn SessionProtocol>) -> Self {
            let (queue, drain) = DispatchQueue::new();
            let router = MessageRouter::new();
            let statuses = Arc::new(Mutex::new(Vec::new()));
            let payloads = Arc::new(Mutex::new(Vec::new()));

            let s = Arc::clone(&statuses);
            router.on_status(TOPIC, move |_, status| s.lock().expect("lock").push(status.clone()));
            let p = Arc::clone(&payloads);
            router.on_message(TOPIC, move |_, payload| p.lock().expect("lock").push(payload.clone()));

            let conn = Connection::new(
                EndpointId::new(TOPIC),
                protocol,
                Arc::new(server.connector()),
                Arc::new(SessionConfig::default()),
                EventSink::new(queue, router),
            );
            Self {
                conn,
                drain,
                statuses,
                payloads,
            }
        }

        fn pubsub(server: &MockServer) -> Self {
            let auth = PubSubAuth {
                token: "token".into(),
                user_id: None,
            };
            Self::new(server, Box::new(PubSubProtocol::new(TOPIC, auth)))
        }

        fn statuses(&mut self) -> Vec<ConnectionStatus> {
            self.drain.drain_once();
            self.statuses.lock().expect("lock").clone()
        }

        fn payloads(&mut self) -> Vec<Value> {
            self.drain.drain_once();
            self.payloads.lock().expect("lock").clone()
        }

        /// Connect and read until the socket is quiet.
        async fn connect(&mut self) {
            self.conn.poll(Instant::now()).await;
            while self.conn.receive_message().await == ReadOutcome::Processed {}
        }
    }

    fn message(n: u64) -> Value {
        json!({
            "type": "MESSAGE",
            "data": {"topic": TOPIC, "message": json!({"n": n}).to_string()}
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_pong_listen_response_reaches_connected() {
        let server = MockServer::new();
        server.respond_like_pubsub(&[""]);
        let mut h = Harness::pubsub(&server);

        h.conn.poll(Instant::now()).await;
        assert_eq!(h.conn.state(), ConnectionState::AwaitingHandshake);
        assert!(h.conn.timeout_at().is_some());

        assert_eq!(h.conn.receive_message().await, ReadOutcome::Processed);
        assert_eq!(h.conn.state(), ConnectionState::Subscribing);

        assert_eq!(h.conn.receive_message().await, ReadOutcome::Processed);
        assert_eq!(h.conn.state(), ConnectionState::Connected);
        assert!(h.conn.handle().is_connected());
        assert_eq!(h.conn.timeout_at(), None);
        assert!(h.conn.next_ping_at().is_some_and(|at| at > Instant::now()));

        assert_eq!(server.sent_kinds(), vec!["PING", "LISTEN"]);
        assert_eq!(
            h.statuses(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures_back_off_and_reset() {
        let server = MockServer::new();
        server.respond_like_pubsub(&[]);
        server.refuse_all(true);
        let mut h = Harness::pubsub(&server);

        let start = Instant::now();
        h.conn.poll(start).await;
        assert_eq!(h.conn.state(), ConnectionState::Disconnected);
        assert_eq!(h.conn.backoff_attempts(), 1);
        let retry = h.conn.next_reconnect_at().expect("retry scheduled");
        assert!(retry >= start + Duration::from_secs(2) && retry < start + Duration::from_secs(3));

        // Not due yet
        h.conn.poll(Instant::now()).await;
        assert_eq!(server.connect_attempts(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        let second = Instant::now();
        h.conn.poll(second).await;
        assert_eq!(h.conn.backoff_attempts(), 2);
        let retry = h.conn.next_reconnect_at().expect("retry scheduled");
        assert!(retry >= second + Duration::from_secs(4) && retry < second + Duration::from_secs(5));

        server.refuse_all(false);
        tokio::time::advance(Duration::from_secs(5)).await;
        h.conn.poll(Instant::now()).await;
        assert_eq!(h.conn.state(), ConnectionState::AwaitingHandshake);
        assert_eq!(h.conn.backoff_attempts(), 0);
        assert_eq!(h.conn.next_reconnect_at(), None);
        assert_eq!(
            h.statuses(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connecting,
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connecting,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_reconnects_hold_one_socket() {
        let server = MockServer::new();
        server.respond_like_pubsub(&[""]);
        let mut h = Harness::pubsub(&server);

        for _ in 0..5 {
            h.conn.reconnect().await;
            assert_eq!(server.open_sockets(), 1);
        }
        h.connect().await;
        h.conn.reconnect().await;
        assert_eq!(server.open_sockets(), 1);
        assert_eq!(server.connect_attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_forces_reconnect() {
        let server = MockServer::new();
        let mut h = Harness::pubsub(&server);

        h.conn.poll(Instant::now()).await;
        assert_eq!(h.conn.state(), ConnectionState::AwaitingHandshake);

        tokio::time::advance(Duration::from_secs(9)).await;
        h.conn.poll(Instant::now()).await;
        assert_eq!(server.connect_attempts(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        h.conn.poll(Instant::now()).await;
        assert_eq!(server.connect_attempts(), 2);
        assert_eq!(server.open_sockets(), 1);
        assert_eq!(h.conn.state(), ConnectionState::AwaitingHandshake);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_ping_and_pong() {
        let server = MockServer::new();
        server.respond_like_pubsub(&[""]);
        let mut h = Harness::pubsub(&server);
        h.connect().await;
        server.clear_sent();

        let ping_at = h.conn.next_ping_at().expect("ping scheduled");
        assert!(ping_at >= Instant::now() + Duration::from_secs(240));

        tokio::time::advance(Duration::from_secs(271)).await;
        h.conn.poll(Instant::now()).await;
        assert_eq!(server.sent_kinds(), vec!["PING"]);
        assert!(h.conn.timeout_at().is_some());

        assert_eq!(h.conn.receive_message().await, ReadOutcome::Processed);
        assert_eq!(h.conn.timeout_at(), None);
        assert!(h.conn.next_ping_at().is_some_and(|at| at > Instant::now()));
        assert_eq!(h.conn.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ping_forces_reconnect() {
        let server = MockServer::new();
        let mut pings = 0;
        server.respond_with(move |frame| match frame["type"].as_str() {
            Some("PING") => {
                pings += 1;
                if pings == 1 {
                    vec![json!({"type": "PONG"})]
                } else {
                    Vec::new()
                }
            }
            Some("LISTEN") => vec![json!({"type": "RESPONSE", "error": ""})],
            _ => Vec::new(),
        });
        let mut h = Harness::pubsub(&server);
        h.connect().await;
        assert_eq!(h.conn.state(), ConnectionState::Connected);

        tokio::time::advance(Duration::from_secs(271)).await;
        h.conn.poll(Instant::now()).await;
        assert_eq!(h.conn.receive_message().await, ReadOutcome::WouldBlock);

        tokio::time::advance(Duration::from_secs(11)).await;
        h.conn.poll(Instant::now()).await;
        assert_eq!(server.connect_attempts(), 2);
        assert_eq!(h.conn.state(), ConnectionState::AwaitingHandshake);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_resends_listen() {
        let server = MockServer::new();
        server.respond_like_pubsub(&["ERR_SERVER", ""]);
        let mut h = Harness::pubsub(&server);
        h.connect().await;

        assert_eq!(h.conn.state(), ConnectionState::Connected);
        assert_eq!(server.sent_kinds(), vec!["PING", "LISTEN", "LISTEN"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_auth_rejects_for_good() {
        let server = MockServer::new();
        server.respond_like_pubsub(&["ERR_BADAUTH"]);
        let mut h = Harness::pubsub(&server);

        h.conn.poll(Instant::now()).await;
        assert_eq!(h.conn.receive_message().await, ReadOutcome::Processed);
        assert_eq!(
            h.conn.receive_message().await,
            ReadOutcome::Rejected("ERR_BADAUTH".into())
        );

        assert!(h.conn.is_closed());
        assert!(h.conn.handle().is_closed());
        assert!(!h.conn.has_socket());
        assert_eq!(server.open_sockets(), 0);
        assert_eq!(h.conn.next_reconnect_at(), None);

        // No timer brings it back
        tokio::time::advance(Duration::from_secs(600)).await;
        h.conn.poll(Instant::now()).await;
        assert_eq!(server.connect_attempts(), 1);
        assert_eq!(
            h.statuses().last(),
            Some(&ConnectionStatus::Rejected("ERR_BADAUTH".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_are_dropped() {
        let server = MockServer::new();
        server.respond_like_pubsub(&[""]);
        let mut h = Harness::pubsub(&server);
        h.connect().await;

        server.push_text("{not json");
        server.push_text("42");
        server.push_json(json!({"data": {"no": "type"}}));
        server.push_json(message(1));
        for _ in 0..4 {
            assert_eq!(h.conn.receive_message().await, ReadOutcome::Processed);
        }

        assert_eq!(h.conn.state(), ConnectionState::Connected);
        assert_eq!(server.connect_attempts(), 1);
        assert_eq!(h.payloads(), vec![json!({"topic": TOPIC, "message": {"n": 1}})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_payloads_arrive_in_wire_order() {
        let server = MockServer::new();
        server.respond_like_pubsub(&[""]);
        let mut h = Harness::pubsub(&server);
        h.connect().await;

        for n in 0..5 {
            server.push_json(message(n));
        }
        while h.conn.receive_message().await == ReadOutcome::Processed {}

        let order: Vec<u64> = h
            .payloads()
            .iter()
            .filter_map(|p| p["message"]["n"].as_u64())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_request_and_broken_socket() {
        let server = MockServer::new();
        server.respond_like_pubsub(&[""]);
        let mut h = Harness::pubsub(&server);
        h.connect().await;

        server.push_json(json!({"type": "RECONNECT"}));
        assert_eq!(h.conn.receive_message().await, ReadOutcome::Reconnected);
        assert_eq!(server.connect_attempts(), 2);
        assert_eq!(h.conn.state(), ConnectionState::AwaitingHandshake);

        while h.conn.receive_message().await == ReadOutcome::Processed {}
        assert_eq!(h.conn.state(), ConnectionState::Connected);

        server.break_socket();
        assert_eq!(h.conn.receive_message().await, ReadOutcome::Reconnected);
        assert_eq!(server.connect_attempts(), 3);
        assert_eq!(server.open_sockets(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_frames_wait_for_connected() {
        let server = MockServer::new();
        server.respond_like_pubsub(&[""]);
        let mut h = Harness::pubsub(&server);
        let handle = h.conn.handle();

        handle.send(json!({"type": "CUSTOM"})).expect("open handle");
        h.conn.poll(Instant::now()).await;
        assert!(h.conn.flush_outbound().await);
        assert_eq!(server.sent_kinds(), vec!["PING"]);

        while h.conn.receive_message().await == ReadOutcome::Processed {}
        assert!(h.conn.flush_outbound().await);
        assert_eq!(server.sent_kinds(), vec!["PING", "LISTEN", "CUSTOM"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_state_event_pair_is_handled() {
        let states = [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::AwaitingHandshake,
            ConnectionState::Subscribing,
            ConnectionState::Connected,
        ];
        let events = || {
            vec![
                Inbound::HandshakeAck,
                Inbound::Pong,
                Inbound::Subscribe(SubscribeAck::Accepted(None)),
                Inbound::Subscribe(SubscribeAck::ServerError("ERR_SERVER".into())),
                Inbound::Subscribe(SubscribeAck::AuthRejected("ERR_BADAUTH".into())),
                Inbound::Subscribe(SubscribeAck::Rejected("ERR_BADTOPIC".into())),
                Inbound::ReconnectRequested,
                Inbound::Payload(json!({})),
                Inbound::Ignored("test".into()),
            ]
        };

        for state in states {
            for event in events() {
                let server = MockServer::new();
                let mut h = Harness::pubsub(&server);
                h.conn.reconnect().await;
                h.conn.set_state(state);

                let label = format!("{event:?} while {state:?}");
                let step = h.conn.on_event(event, Instant::now()).await;
                assert!(server.open_sockets() <= 1, "{label}");
                match step {
                    Step::Rejected(_) => {
                        assert!(h.conn.is_closed(), "{label}");
                        assert_eq!(server.open_sockets(), 0, "{label}");
                    }
                    Step::Reconnected => {
                        assert_eq!(h.conn.state(), ConnectionState::AwaitingHandshake, "{label}");
                    }
                    Step::Continue => assert!(!h.conn.is_closed(), "{label}"),
                }
            }
        }
    }

    /// Accepts any slot and answers `Get` with a null for every requested key.
    fn archipelago_room(frame: &Value) -> Vec<Value> {
        match frame[0]["cmd"].as_str() {
            Some("Connect") => vec![json!([{"cmd": "Connected", "slot": 2}])],
            Some("Get") => {
                let keys: serde_json::Map<String, Value> = frame[0]["keys"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                    .map(|key| (key.to_string(), Value::Null))
                    .collect();
                vec![json!([{"cmd": "Retrieved", "keys": keys}])]
            }
            _ => Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_archipelago_session() {
        let server = MockServer::new();
        server.respond_with(archipelago_room);
        // wss refused, ws accepted within the same attempt
        server.refuse_next(1);
        let credentials = "Axton:pw@localhost:38281".parse().expect("valid login");
        let mut h = Harness::new(
            &server,
            Box::new(ArchipelagoProtocol::new(credentials, "Borderlands 2")),
        );

        h.conn.poll(Instant::now()).await;
        assert_eq!(
            server.connect_urls(),
            vec!["wss://localhost:38281", "ws://localhost:38281"]
        );
        assert_eq!(h.conn.state(), ConnectionState::AwaitingHandshake);
        assert_eq!(h.conn.backoff_attempts(), 0);
        assert!(server.sent().is_empty());

        server.push_json(json!([{"cmd": "RoomInfo", "version": {}}]));
        assert_eq!(h.conn.receive_message().await, ReadOutcome::Processed);
        assert_eq!(h.conn.state(), ConnectionState::Subscribing);
        assert_eq!(h.conn.receive_message().await, ReadOutcome::Processed);
        assert_eq!(h.conn.state(), ConnectionState::Connected);

        server.push_json(json!([{"cmd": "PrintJSON", "data": [{"text": "hi"}]}]));
        assert_eq!(h.conn.receive_message().await, ReadOutcome::Processed);
        let payloads = h.payloads();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0]["cmd"], "Connected");
        assert_eq!(payloads[1]["cmd"], "PrintJSON");

        tokio::time::advance(Duration::from_secs(271)).await;
        h.conn.poll(Instant::now()).await;
        assert_eq!(server.sent_kinds(), vec!["CONNECT", "GET"]);
        assert_eq!(h.conn.receive_message().await, ReadOutcome::Processed);
        assert_eq!(h.conn.timeout_at(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_archipelago_data_storage_reply_reaches_router() {
        let server = MockServer::new();
        server.respond_with(archipelago_room);
        let credentials = "Axton:pw@localhost:38281".parse().expect("valid login");
        let mut h = Harness::new(
            &server,
            Box::new(ArchipelagoProtocol::new(credentials, "Borderlands 2")),
        );

        h.conn.poll(Instant::now()).await;
        server.push_json(json!([{"cmd": "RoomInfo"}]));
        while h.conn.receive_message().await == ReadOutcome::Processed {}
        assert_eq!(h.conn.state(), ConnectionState::Connected);
        let ping_at = h.conn.next_ping_at();

        h.conn
            .handle()
            .send(json!([{"cmd": "Get", "keys": ["my_key"]}]))
            .expect("open handle");
        assert!(h.conn.flush_outbound().await);
        assert_eq!(h.conn.receive_message().await, ReadOutcome::Processed);

        // Not mistaken for the keepalive answer
        assert_eq!(h.conn.next_ping_at(), ping_at);
        let payloads = h.payloads();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1], json!({"cmd": "Retrieved", "keys": {"my_key": null}}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_archipelago_refusal() {
        let server = MockServer::new();
        server.respond_with(|_| {
            vec![json!([{"cmd": "ConnectionRefused", "errors": ["InvalidSlot"]}])]
        });
        let credentials = "Nobody@localhost:38281".parse().expect("valid login");
        let mut h = Harness::new(
            &server,
            Box::new(ArchipelagoProtocol::new(credentials, "Borderlands 2")),
        );

        h.conn.poll(Instant::now()).await;
        server.push_json(json!([{"cmd": "RoomInfo"}]));
        assert_eq!(h.conn.receive_message().await, ReadOutcome::Processed);
        assert_eq!(
            h.conn.receive_message().await,
            ReadOutcome::Rejected("InvalidSlot".into())
        );
        assert_eq!(server.open_sockets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_socket() {
        let server = MockServer::new();
        server.respond_like_pubsub(&[""]);
        let mut h = Harness::pubsub(&server);
        h.connect().await;

        h.conn.shutdown().await;
        assert_eq!(server.open_sockets(), 0);
        assert!(h.conn.handle().is_closed());
        assert_eq!(h.conn.handle().state(), ConnectionState::Disconnected);
        assert_eq!(h.statuses().last(), Some(&ConnectionStatus::Closed));
    }
}
