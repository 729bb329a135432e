//! Error types for the client crate.
//!
//! Nothing here crosses the poll thread boundary: the worker turns every
//! [`TransportError`] into a state transition. [`RegistryError`] is what the host
//! sees from the registry's control surface.

use crate::endpoint::EndpointId;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("Connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Socket closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No connection registered for {0}")]
    UnknownEndpoint(EndpointId),
    #[error("Connection for {0} is shutting down")]
    ChannelClosed(EndpointId),
    #[error("Failed to start poll thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}
