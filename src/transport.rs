//! Transport boundary between the session and the device's websocket.
//!
//! The session only needs text messages in both directions, a graceful close and
//! a forced teardown. [`WebSocketConnector`] provides those over
//! `tokio-tungstenite`; tests plug in in-memory pipes.
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("close failed: {0}")]
    Close(String),
}

/// One open, message-oriented connection to the device.
#[async_trait]
pub trait SessionTransport: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text message; `None` once the connection is closed.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Starts a graceful close. `recv` keeps draining until the peer acknowledges.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Drops the connection immediately without a close handshake.
    fn terminate(self: Box<Self>);
}

/// Opens transports. Called once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn SessionTransport>, TransportError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn SessionTransport>, TransportError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(%url, status = %response.status(), "websocket open");
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SessionTransport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(
                        String::from_utf8(bytes)
                            .map_err(|e| TransportError::Receive(format!("binary frame: {e}"))),
                    )
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "close frame received");
                    return None;
                }
                // ping/pong are answered by tungstenite itself
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return None
                }
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Close(e.to_string()))
    }

    fn terminate(self: Box<Self>) {
        debug!("websocket terminated");
    }
}
