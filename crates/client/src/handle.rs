//! Connection lifecycle types visible to the host.
//!
//! The poll thread owns every [`Connection`](crate::connection::Connection); the host only
//! holds a [`ConnectionHandle`], which shares the connection's state cell, its outbound
//! channel and its close token.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::endpoint::EndpointId;
use crate::error::RegistryError;

/// State of one connection's session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; waiting for the next reconnect time
    Disconnected,
    /// Opening the socket
    Connecting,
    /// Socket open, waiting for the handshake acknowledgement
    AwaitingHandshake,
    /// Subscribe request sent, waiting for its acknowledgement
    Subscribing,
    /// Subscribed and kept alive by periodic pings
    Connected,
}

impl ConnectionState {
    /// Convert to u8 for atomic storage.
    pub fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::AwaitingHandshake => 2,
            ConnectionState::Subscribing => 3,
            ConnectionState::Connected => 4,
        }
    }

    /// Convert from u8 (atomic storage).
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::AwaitingHandshake,
            3 => ConnectionState::Subscribing,
            4 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Whether a socket is held in this state.
    pub fn has_socket(self) -> bool {
        !matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Connecting
        )
    }
}

/// Externally visible status, published to status subscribers through the dispatch queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// A connect attempt is in progress
    Connecting,
    /// Subscribed and live
    Connected,
    /// Socket lost or connect failed; a retry is scheduled
    Disconnected,
    /// The server refused the session for good; the endpoint was removed
    Rejected(String),
    /// Closed at the host's request
    Closed,
}

/// Host-side handle to a registered connection.
///
/// Cloning is cheap. Dropping a handle does NOT close the connection; use
/// [`Registry::close`](crate::registry::Registry::close).
#[derive(Clone)]
pub struct ConnectionHandle {
    id: EndpointId,
    state: Arc<AtomicU8>,
    outbound: mpsc::UnboundedSender<Value>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: EndpointId,
        state: Arc<AtomicU8>,
        outbound: mpsc::UnboundedSender<Value>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id,
            state,
            outbound,
            closed,
        }
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether the connection was closed or rejected.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Queue a raw frame; it is written once the session is connected.
    pub fn send(&self, frame: Value) -> Result<(), RegistryError> {
        if self.is_closed() {
            return Err(RegistryError::ChannelClosed(self.id.clone()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| RegistryError::ChannelClosed(self.id.clone()))
    }

    pub(crate) fn close_token(&self) -> &CancellationToken {
        &self.closed
    }

    /// Whether two handles refer to the same connection instance.
    pub(crate) fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Internal helper to publish a state change to the handle's shared cell.
pub(crate) fn set_connection_state(state_ref: &AtomicU8, new_state: ConnectionState) {
    state_ref.store(new_state.to_u8(), Ordering::SeqCst);
}
