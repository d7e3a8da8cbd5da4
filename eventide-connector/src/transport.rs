//! # Socket Transport
//!
//! The event subscription client talks to the node through two small traits, so
//! tests can swap the websocket for an in-memory connection.
//!
//! The default [`WebsocketDialer`] uses `tokio-tungstenite`. TLS is chosen by the
//! URL scheme (`wss://`). Ping and pong frames are handled below this layer; a
//! close frame or end of stream surfaces as [`TransportError::Closed`].

use crate::error::TransportError;
use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::sync::Arc;
use tokio::{net::TcpStream, sync::Mutex};
use tokio_util::sync::CancellationToken;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{http::Uri, Message},
    MaybeTlsStream, WebSocketStream,
};

/// Opens a [`Connection`] to a URL.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Gives up with [`TransportError::Cancelled`] once `ctx` is cancelled.
    async fn dial(
        &self,
        ctx: &CancellationToken,
        url: &str,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

/// A bidirectional, frame-oriented connection.
///
/// `send` and `receive` may be called concurrently from different tasks.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Waits for the next data frame. Errors are permanent: once `receive` fails,
    /// the connection is unusable.
    async fn receive(&self) -> Result<Vec<u8>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The default [`Dialer`], backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WebsocketDialer;

#[async_trait]
impl Dialer for WebsocketDialer {
    async fn dial(
        &self,
        ctx: &CancellationToken,
        url: &str,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let connected = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(TransportError::Cancelled),
            connected = connect_async(url) => connected,
        };
        let (stream, _response) = connected.map_err(|e| TransportError::Dial {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        tracing::debug!(url, "Websocket connection established.");

        let (sink, stream) = stream.split();
        Ok(Arc::new(WebsocketConnection {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }))
    }
}

/// A websocket split into independently locked halves.
pub struct WebsocketConnection {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

#[async_trait]
impl Connection for WebsocketConnection {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let message = match String::from_utf8(frame) {
            Ok(text) => Message::Text(text),
            Err(err) => Message::Binary(err.into_bytes()),
        };
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Binary(bytes))) => return Ok(bytes),
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(e)) => return Err(TransportError::Receive(e.to_string())),
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

/// Converts a node RPC URL into its websocket endpoint.
///
/// `http`, `ws` and `tcp` hosts map to `ws://<host>/websocket`; every other
/// scheme (including `https`) maps to `wss://<host>/websocket`.
pub fn rpc_to_websocket_url(rpc_url: &str) -> Result<String, TransportError> {
    let uri: Uri = rpc_url
        .parse()
        .map_err(|_| TransportError::InvalidUrl(rpc_url.to_string()))?;
    let host = uri
        .authority()
        .ok_or_else(|| TransportError::InvalidUrl(rpc_url.to_string()))?;

    let scheme = match uri.scheme_str() {
        Some("http" | "ws" | "tcp") => "ws",
        _ => "wss",
    };
    Ok(format!("{scheme}://{host}/websocket"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_follows_scheme() {
        assert_eq!(
            rpc_to_websocket_url("http://localhost:26657").unwrap(),
            "ws://localhost:26657/websocket"
        );
        assert_eq!(
            rpc_to_websocket_url("tcp://127.0.0.1:26657").unwrap(),
            "ws://127.0.0.1:26657/websocket"
        );
        assert_eq!(
            rpc_to_websocket_url("https://rpc.example.org/some/path").unwrap(),
            "wss://rpc.example.org/websocket"
        );
    }

    #[tokio::test]
    async fn cancelled_dial_gives_up_at_once() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let result = WebsocketDialer.dial(&ctx, "ws://127.0.0.1:9/websocket").await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }

    #[test]
    fn websocket_url_requires_a_host() {
        assert!(matches!(
            rpc_to_websocket_url("not a url"),
            Err(TransportError::InvalidUrl(_))
        ));
    }
}
