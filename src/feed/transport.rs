//! Bidirectional message transport to the feed.
//!
//! Features:
//! - Opaque text payloads in both directions
//! - Ping/pong frames answered below this layer
//! - WebSocket implementation over tokio-tungstenite

use std::future::Future;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::auth::{Credential, Endpoint};
use crate::error::TransportError;

/// An open connection to the feed.
pub trait Transport: Send {
    /// Send one text payload.
    fn send(&mut self, payload: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait for the next text payload; `Ok(None)` means the peer closed cleanly.
    ///
    /// Must be cancel-safe: dropping the future before it resolves loses nothing.
    fn recv(&mut self) -> impl Future<Output = Result<Option<String>, TransportError>> + Send;

    /// Close the connection, giving the peer a chance to see the close.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens transports.
pub trait Connector: Send + Sync {
    /// Transport produced by this connector.
    type Transport: Transport + 'static;

    /// Open a transport to `endpoint` using `credential`.
    fn connect(
        &self,
        endpoint: &Endpoint,
        credential: &Credential,
        connect_id: &str,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

/// Build the connect URL: `{endpoint}?connectId=..&token=..`.
pub fn connect_url(endpoint: &Endpoint, token: &str, connect_id: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(&endpoint.url)
        .map_err(|e| TransportError::ConnectionFailed(format!("bad endpoint {}: {e}", endpoint.url)))?;
    url.query_pairs_mut()
        .append_pair("connectId", connect_id)
        .append_pair("token", token);
    Ok(url)
}

/// WebSocket connector.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    /// Create a new connector.
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        credential: &Credential,
        connect_id: &str,
    ) -> Result<WsTransport, TransportError> {
        let url = connect_url(endpoint, &credential.token, connect_id)?;
        info!(endpoint = %endpoint.url, connect_id, "Connecting to WebSocket");

        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(WsTransport { stream })
    }
}

/// WebSocket transport.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport").finish_non_exhaustive()
    }
}

impl Transport for WsTransport {
    async fn send(&mut self, payload: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(payload))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => {
                        return Err(TransportError::Protocol("non-utf8 binary frame".to_string()))
                    }
                },
                Some(Ok(Message::Ping(_))) => {
                    // Note: tungstenite auto-responds to pings
                    debug!("Received ping");
                }
                Some(Ok(Message::Pong(_))) => {
                    debug!("Received pong");
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!(frame = ?frame, "WebSocket closed");
                    return match frame {
                        Some(frame) => Err(TransportError::Closed {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.to_string(),
                        }),
                        None => Ok(None),
                    };
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => return Err(TransportError::Tungstenite(e)),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "WebSocket close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn connect_url_appends_id_and_token() {
        let endpoint = Endpoint::new("wss://ws-api.example.com/endpoint");
        let url = connect_url(&endpoint, "tok+en", "8888").unwrap();

        assert_eq!(
            url.as_str(),
            "wss://ws-api.example.com/endpoint?connectId=8888&token=tok%2Ben"
        );
    }

    #[test]
    fn connect_url_rejects_garbage_endpoint() {
        let endpoint = Endpoint::new("not a url");
        assert!(matches!(
            connect_url(&endpoint, "t", "1"),
            Err(TransportError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn ws_connect_failure_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let credential = Credential::new("t", vec![], Duration::from_secs(60));
        let endpoint = Endpoint::new(format!("ws://{addr}/endpoint"));
        let result = WsConnector::new().connect(&endpoint, &credential, "1").await;

        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
