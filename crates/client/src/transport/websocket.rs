//! Websocket transport using tokio-tungstenite

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{Connector, Recv, Transport};
use crate::error::TransportError;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` and `wss://` sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, _response) =
            connect_async(url)
                .await
                .map_err(|e| TransportError::Connect {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        tracing::debug!("Websocket open to {}", url);
        Ok(Box::new(WsTransport::new(stream)))
    }
}

/// A websocket session.
///
/// `readable` parks the next stream item in `pending` so the following `try_recv`
/// returns it without touching the socket.
pub struct WsTransport {
    stream: WsStream,
    pending: Option<Option<Result<Message, WsError>>>,
}

impl WsTransport {
    pub fn new(stream: WsStream) -> Self {
        Self {
            stream,
            pending: None,
        }
    }

    fn next_item(&mut self) -> Option<Option<Result<Message, WsError>>> {
        self.pending
            .take()
            .or_else(|| self.stream.next().now_or_never())
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
                other => TransportError::Send(other.to_string()),
            })
    }

    fn try_recv(&mut self) -> Recv {
        loop {
            let Some(item) = self.next_item() else {
                return Recv::WouldBlock;
            };
            match item {
                None => return Recv::Closed(None),
                Some(Ok(Message::Text(text))) => return Recv::Frame(text),
                Some(Ok(Message::Binary(bytes))) => {
                    return Recv::Frame(String::from_utf8_lossy(&bytes).into_owned())
                }
                Some(Ok(Message::Close(frame))) => {
                    return Recv::Closed(frame.map(|f| format!("{} {}", u16::from(f.code), f.reason)))
                }
                // Control frames are answered by tungstenite itself
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(e)) => return Recv::Closed(Some(e.to_string())),
            }
        }
    }

    async fn readable(&mut self) {
        if self.pending.is_none() {
            let item = self.stream.next().await;
            self.pending = Some(item);
        }
    }

    async fn close(&mut self) {
        self.pending = None;
        match tokio::time::timeout(CLOSE_GRACE, self.stream.close(None)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Websocket close handshake failed: {}", e),
            Err(_) => tracing::debug!("Websocket close handshake timed out"),
        }
    }
}
