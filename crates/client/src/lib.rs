//! modlink Client - Reconnecting socket sessions bridged into a single-threaded host
//!
//! A host that may only run callbacks on its own tick thread opens remote endpoints
//! through a [`Registry`]. One background thread per registry keeps every session
//! alive (connect, handshake, subscribe, keepalive, reconnect with backoff) and hands
//! decoded payloads and status changes to the host through the [`DispatchQueue`]. The
//! host drains the queue once per tick, which runs the [`MessageRouter`] subscribers.
//!
//! ## Architecture Role
//!
//! ```text
//! host tick thread                       poll thread (one per registry)
//! ─────────────────                      ──────────────────────────────
//! Registry::open/close/send_raw ──────▶  Connection state machines
//! MainThreadDrain::drain_once   ◀──────  DispatchQueue (payloads, status)
//!   └─ MessageRouter subscribers
//! ```
//!
//! ## Design Principles
//!
//! 1. **No ambient globals** - registry, queue and router are explicit objects
//! 2. **Failures are transitions** - I/O errors, timeouts and bad frames never reach the
//!    host as errors; they move the state machine
//! 3. **Host-thread delivery** - subscribers only run inside `drain_once`
//! 4. **Swappable sockets** - the state machine talks to [`Transport`]/[`Connector`]
//!    traits; [`WsConnector`] is the production implementation

pub mod backoff;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod handle;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// =============================================================================
// Host surface
// =============================================================================
pub use dispatch::{Callback, DispatchQueue, MainThreadDrain};
pub use endpoint::EndpointId;
pub use handle::{ConnectionHandle, ConnectionState, ConnectionStatus};
pub use registry::Registry;
pub use router::{EventSink, MessageRouter, MessageSubscriber, StatusSubscriber};

// =============================================================================
// Sessions
// =============================================================================
pub use backoff::BackoffState;
pub use config::SessionConfig;
pub use connection::{Connection, ReadOutcome};
pub use protocol::{
    ArchipelagoProtocol, Inbound, PubSubAuth, PubSubProtocol, SessionProtocol, SubscribeAck,
};

// =============================================================================
// Transport + errors
// =============================================================================
pub use error::{RegistryError, TransportError};
pub use transport::{Connector, Recv, Transport, WsConnector, WsTransport};
