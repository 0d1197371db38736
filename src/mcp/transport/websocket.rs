//! WebSocket transport for MCP
//!
//! One JSON-RPC message per frame in each direction. Text frames are the
//! norm; Binary frames are accepted if they hold UTF-8. Ping/pong is
//! answered by tungstenite. There is no read timeout: idle detection on a
//! persistent socket is left to the caller.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{ConduitError, Result};
use crate::mcp::config::ServerConfig;
use crate::mcp::transport::{
    channel_closed, connect_error, shared_receiver_stream, MessageStream, Transport,
};

/// Persistent WebSocket connection to an MCP server.
#[derive(Debug)]
pub struct WebSocketTransport {
    server: String,
    outbound_tx: mpsc::UnboundedSender<Message>,
    inbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    error_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    shutdown: CancellationToken,
}

impl WebSocketTransport {
    /// Perform the WebSocket handshake, bounded by `http_timeout_seconds`.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Connection`] if the handshake fails or times
    /// out, and [`ConduitError::Config`] for an invalid header.
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let url = config.parsed_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| connect_error(&config.name, e))?;
        for (k, v) in config.effective_headers() {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| ConduitError::Config(format!("invalid header name '{k}': {e}")))?;
            let value = HeaderValue::from_str(&v)
                .map_err(|e| ConduitError::Config(format!("invalid value for header '{k}': {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let http_timeout = config.http_timeout();
        let (ws, response) =
            match tokio::time::timeout(http_timeout, tokio_tungstenite::connect_async(request)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(connect_error(&config.name, e)),
                Err(_) => {
                    return Err(connect_error(
                        &config.name,
                        format!("WebSocket handshake with {url} exceeded {http_timeout:?}"),
                    ))
                }
            };
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(connect_error(
                &config.name,
                format!("unexpected handshake status {}", response.status()),
            ));
        }
        tracing::debug!(server = %config.name, url = %url, "WebSocket connected");

        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let server = config.name.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    msg = outbound_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let closing = matches!(msg, Message::Close(_));
                        if let Err(e) = sink.send(msg).await {
                            tracing::warn!(server = %server, error = %e, "WebSocket write failed");
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                }
            }
        });

        let server = config.name.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = token.cancelled() => break,
                    frame = stream.next() => frame,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(text.as_str().to_string()).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            if inbound_tx.send(text).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(server = %server, error = %e, "dropping non-UTF-8 binary frame");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(server = %server, frame = ?frame, "WebSocket closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(server = %server, error = %e, "WebSocket read failed");
                        let _ = error_tx.send(format!("WebSocket read failed: {e}"));
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok(Self {
            server: config.name.clone(),
            outbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            error_rx: Arc::new(Mutex::new(error_rx)),
            shutdown,
        })
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, message: String) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(channel_closed("WebSocket"));
        }
        self.outbound_tx
            .send(Message::Text(message.into()))
            .map_err(|_| channel_closed("WebSocket"))
    }

    fn receive(&self) -> MessageStream<'_> {
        shared_receiver_stream(Arc::clone(&self.inbound_rx))
    }

    fn receive_err(&self) -> MessageStream<'_> {
        shared_receiver_stream(Arc::clone(&self.error_rx))
    }

    async fn close(&self) -> Result<()> {
        if !self.shutdown.is_cancelled() {
            tracing::debug!(server = %self.server, "closing WebSocket");
            self.shutdown.cancel();
        }
        Ok(())
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
