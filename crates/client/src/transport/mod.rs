//! Socket primitives consumed by the connection state machine.
//!
//! The state machine never touches a concrete socket. It opens sessions through a
//! [`Connector`] and drives them through a [`Transport`], which gives it exactly the
//! operations it needs: send, a non-blocking receive, a readiness wait for the poll
//! loop's multiplexer, and close.

mod websocket;

pub use websocket::{WsConnector, WsTransport};

use async_trait::async_trait;

use crate::error::TransportError;

/// Outcome of one non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recv {
    /// One text frame
    Frame(String),
    /// Nothing buffered right now
    WouldBlock,
    /// The peer closed the socket or it broke; carries the reason if known
    Closed(Option<String>),
}

/// One open, full-duplex, text-framed socket.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Read one frame without blocking.
    fn try_recv(&mut self) -> Recv;

    /// Resolve once [`Transport::try_recv`] would not return [`Recv::WouldBlock`].
    ///
    /// Must be cancel-safe: the poll loop drops this future when another socket wins
    /// the readiness race.
    async fn readable(&mut self);

    async fn close(&mut self);
}

/// Opens transports to URLs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}
