//! WebSocket link to the recognition service.
//!
//! Each WebSocket text frame carries one or more `\n`-terminated JSON lines.
//! Control frames (ping/pong) are handled by tungstenite and never reach the
//! session; a close frame ends the link like a dropped socket would.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::Message as WsMessage,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use crate::application::session_transport::{Connector, DuplexLink, TransportError};

/// Opens WebSocket links to a fixed service URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn DuplexLink>, TransportError> {
        let attempt = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()));
        let (ws, response) = attempt
            .await
            .map_err(|_| {
                TransportError::Connect(format!(
                    "{} did not answer within {:?}",
                    self.url, self.connect_timeout
                ))
            })?
            .map_err(|e| TransportError::Connect(format!("{}: {e}", self.url)))?;
        debug!("WebSocket handshake with {} ({})", self.url, response.status());
        Ok(Box::new(WsLink { ws }))
    }
}

struct WsLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl DuplexLink for WsLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.ws
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv_text(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            let frame = match self.ws.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(TransportError::Receive(e.to_string())),
                Some(Ok(frame)) => frame,
            };
            match frame {
                WsMessage::Text(text) => return Ok(Some(text)),
                WsMessage::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => warn!("non-UTF-8 binary frame from service (ignored)"),
                },
                WsMessage::Close(frame) => {
                    debug!("service sent close frame: {frame:?}");
                    return Ok(None);
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!("WebSocket close: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_to_closed_port_fails_with_connect_error() {
        // Arrange: bind then drop a listener so the port is almost certainly closed
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let connector = WsConnector::new(format!("ws://127.0.0.1:{port}/scan"), Duration::from_secs(2));

        // Act
        let result = connector.connect().await;

        // Assert
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[test]
    fn test_connector_keeps_url() {
        let connector = WsConnector::new("ws://service:8765/scan", Duration::from_secs(5));
        assert_eq!(connector.url(), "ws://service:8765/scan");
    }
}
