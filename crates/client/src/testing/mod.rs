//! In-memory transport doubles for tests.
//!
//! A [`MockServer`] stands in for the remote service: it can refuse connects, script
//! replies to whatever the client sends, and push frames or a close at any time. Tests
//! drive a connection against it and assert on what was sent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::error::TransportError;
use crate::transport::{Connector, Recv, Transport};

type Responder = Box<dyn FnMut(&Value) -> Vec<Value> + Send>;

#[derive(Default)]
struct ServerState {
    refuse_next: usize,
    refuse_all: bool,
    connect_urls: Vec<String>,
    last_socket: u64,
    /// Inbound queue of every open socket
    sockets: HashMap<u64, VecDeque<Recv>>,
    sent: Vec<Value>,
    responder: Option<Responder>,
}

/// Scriptable stand-in for a remote endpoint.
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
    notify: Arc<Notify>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            server: self.clone(),
        }
    }

    /// Refuse the next `n` connect attempts.
    pub fn refuse_next(&self, n: usize) {
        self.lock().refuse_next = n;
    }

    /// Refuse every connect attempt until switched off.
    pub fn refuse_all(&self, refuse: bool) {
        self.lock().refuse_all = refuse;
    }

    /// Reply to every frame the client sends; replies are queued on the current socket.
    pub fn respond_with(&self, responder: impl FnMut(&Value) -> Vec<Value> + Send + 'static) {
        self.lock().responder = Some(Box::new(responder));
    }

    /// Behave like Twitch PubSub: PONG every PING, and answer each LISTEN with a
    /// RESPONSE carrying the next error from `listen_errors` (empty once exhausted).
    pub fn respond_like_pubsub(&self, listen_errors: &[&'static str]) {
        let mut errors: VecDeque<&'static str> = listen_errors.iter().copied().collect();
        self.respond_with(move |frame| match frame["type"].as_str() {
            Some("PING") => vec![json!({"type": "PONG"})],
            Some("LISTEN") => vec![json!({
                "type": "RESPONSE",
                "nonce": frame["nonce"].clone(),
                "error": errors.pop_front().unwrap_or(""),
            })],
            _ => Vec::new(),
        });
    }

    fn broadcast(&self, item: Recv) {
        for inbound in self.lock().sockets.values_mut() {
            inbound.push_back(item.clone());
        }
        self.notify.notify_waiters();
    }

    /// Queue a raw text frame on every open socket.
    pub fn push_text(&self, text: impl Into<String>) {
        self.broadcast(Recv::Frame(text.into()));
    }

    pub fn push_json(&self, value: Value) {
        self.push_text(value.to_string());
    }

    /// Make every open socket report a broken connection.
    pub fn break_socket(&self) {
        self.broadcast(Recv::Closed(Some("connection reset".to_string())));
    }

    /// Every frame the client has sent, in order.
    pub fn sent(&self) -> Vec<Value> {
        self.lock().sent.clone()
    }

    /// Upper-cased `type`/`cmd` of every sent frame, flattening command arrays.
    pub fn sent_kinds(&self) -> Vec<String> {
        self.sent()
            .iter()
            .flat_map(|frame| match frame {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            })
            .filter_map(|frame| {
                frame
                    .as_object()
                    .and_then(modlink_protocol::discriminator)
            })
            .collect()
    }

    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_urls.len()
    }

    pub fn connect_urls(&self) -> Vec<String> {
        self.lock().connect_urls.clone()
    }

    /// Sockets opened and not yet closed or dropped.
    pub fn open_sockets(&self) -> usize {
        self.lock().sockets.len()
    }
}

/// [`Connector`] backed by a [`MockServer`].
#[derive(Clone)]
pub struct MockConnector {
    server: MockServer,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let mut state = self.server.lock();
        state.connect_urls.push(url.to_string());
        if state.refuse_all || state.refuse_next > 0 {
            state.refuse_next = state.refuse_next.saturating_sub(1);
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        state.last_socket += 1;
        let socket = state.last_socket;
        state.sockets.insert(socket, VecDeque::new());
        Ok(Box::new(MockTransport {
            server: self.server.clone(),
            socket,
        }))
    }
}

/// One socket accepted by a [`MockServer`].
pub struct MockTransport {
    server: MockServer,
    socket: u64,
}

impl MockTransport {
    fn release(&mut self) {
        self.server.lock().sockets.remove(&self.socket);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let mut state = self.server.lock();
        if !state.sockets.contains_key(&self.socket) {
            return Err(TransportError::Closed);
        }
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| TransportError::Send(format!("client sent invalid JSON: {e}")))?;
        let replies = state
            .responder
            .as_mut()
            .map(|respond| respond(&value))
            .unwrap_or_default();
        state.sent.push(value);
        let replied = !replies.is_empty();
        if let Some(inbound) = state.sockets.get_mut(&self.socket) {
            inbound.extend(replies.into_iter().map(|reply| Recv::Frame(reply.to_string())));
        }
        drop(state);
        if replied {
            self.server.notify.notify_waiters();
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Recv {
        match self.server.lock().sockets.get_mut(&self.socket) {
            Some(inbound) => inbound.pop_front().unwrap_or(Recv::WouldBlock),
            None => Recv::Closed(Some("socket closed".to_string())),
        }
    }

    async fn readable(&mut self) {
        loop {
            // Created before the check so a concurrent notify_waiters is not missed
            let notified = self.server.notify.notified();
            let ready = self
                .server
                .lock()
                .sockets
                .get(&self.socket)
                .map_or(true, |inbound| !inbound.is_empty());
            if ready {
                return;
            }
            notified.await;
        }
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.release();
    }
}
