//! MCP transport abstraction and implementations
//!
//! This module defines the [`Transport`] trait that every wire adapter
//! satisfies, and [`AnyTransport`], the closed set of adapters a session can
//! own:
//!
//! - [`stdio::StdioTransport`] -- child process, newline-delimited JSON.
//! - [`sse::SseTransport`] -- legacy HTTP+SSE (GET stream, POST endpoint).
//! - [`websocket::WebSocketTransport`] -- one message per frame.
//! - [`http::HttpTransport`] -- streamable HTTP with JSON or SSE bodies.
//! - [`memory::MemoryTransport`] -- in-process pair for tests and embedding.
//!
//! # Design
//!
//! Callers `send` a serialized JSON-RPC string and `receive` a stream of
//! complete JSON-RPC strings. Framing and reassembly of fragmented input
//! are each adapter's job; the session never sees a partial message. The
//! `receive` stream ending means the underlying channel is gone.
//!
//! `receive_err` carries diagnostics (child stderr). It is never an error
//! condition.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{mpsc, Mutex};

use crate::error::{ConduitError, Result};
use crate::mcp::config::{ServerConfig, TransportKind};

pub mod event_stream;
pub mod http;
pub mod memory;
pub mod sse;
pub mod stdio;
pub mod websocket;

/// Pinned, `Send` stream of complete messages borrowed from a transport.
pub type MessageStream<'a> = Pin<Box<dyn Stream<Item = String> + Send + 'a>>;

/// Abstraction over MCP transport implementations.
///
/// # Examples
///
/// ```no_run
/// use conduit::mcp::config::ServerConfig;
/// use conduit::mcp::transport::{AnyTransport, Transport};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let cfg = ServerConfig::stdio("fetch", "uvx", &["mcp-server-fetch"]);
/// let transport = AnyTransport::connect(&cfg).await?;
/// transport.send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.into()).await?;
/// transport.close().await?;
/// # Ok(())
/// # }
/// ```
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send one complete JSON-RPC message.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Transport`] when the write fails.
    async fn send(&self, message: String) -> Result<()>;

    /// Stream of inbound messages. Ends when the channel closes.
    fn receive(&self) -> MessageStream<'_>;

    /// Stream of diagnostic lines. May be empty.
    fn receive_err(&self) -> MessageStream<'_>;

    /// Release the underlying process, socket, or HTTP session.
    ///
    /// Idempotent. After `close` the `receive` stream ends.
    async fn close(&self) -> Result<()>;
}

/// The closed set of transports a session can own.
#[derive(Debug)]
pub enum AnyTransport {
    Stdio(stdio::StdioTransport),
    Sse(sse::SseTransport),
    WebSocket(websocket::WebSocketTransport),
    StreamableHttp(http::HttpTransport),
    Memory(memory::MemoryTransport),
}

impl AnyTransport {
    /// Open the transport described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Connection`] when the process cannot be
    /// spawned or the endpoint cannot be reached, and
    /// [`ConduitError::Config`] for an unusable URL.
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        tracing::debug!(
            server = %config.name,
            transport = %config.transport,
            "opening transport"
        );
        let transport = match config.transport {
            TransportKind::Stdio => AnyTransport::Stdio(stdio::StdioTransport::from_config(config)?),
            TransportKind::StreamableHttp => {
                AnyTransport::StreamableHttp(http::HttpTransport::from_config(config)?)
            }
            TransportKind::Sse => AnyTransport::Sse(sse::SseTransport::connect(config).await?),
            TransportKind::Websocket => {
                AnyTransport::WebSocket(websocket::WebSocketTransport::connect(config).await?)
            }
        };
        Ok(transport)
    }

    /// Short label for logs and status tables.
    pub fn kind(&self) -> &'static str {
        match self {
            AnyTransport::Stdio(_) => "stdio",
            AnyTransport::Sse(_) => "sse",
            AnyTransport::WebSocket(_) => "websocket",
            AnyTransport::StreamableHttp(_) => "streamable_http",
            AnyTransport::Memory(_) => "memory",
        }
    }
}

#[async_trait::async_trait]
impl Transport for AnyTransport {
    async fn send(&self, message: String) -> Result<()> {
        match self {
            AnyTransport::Stdio(t) => t.send(message).await,
            AnyTransport::Sse(t) => t.send(message).await,
            AnyTransport::WebSocket(t) => t.send(message).await,
            AnyTransport::StreamableHttp(t) => t.send(message).await,
            AnyTransport::Memory(t) => t.send(message).await,
        }
    }

    fn receive(&self) -> MessageStream<'_> {
        match self {
            AnyTransport::Stdio(t) => t.receive(),
            AnyTransport::Sse(t) => t.receive(),
            AnyTransport::WebSocket(t) => t.receive(),
            AnyTransport::StreamableHttp(t) => t.receive(),
            AnyTransport::Memory(t) => t.receive(),
        }
    }

    fn receive_err(&self) -> MessageStream<'_> {
        match self {
            AnyTransport::Stdio(t) => t.receive_err(),
            AnyTransport::Sse(t) => t.receive_err(),
            AnyTransport::WebSocket(t) => t.receive_err(),
            AnyTransport::StreamableHttp(t) => t.receive_err(),
            AnyTransport::Memory(t) => t.receive_err(),
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            AnyTransport::Stdio(t) => t.close().await,
            AnyTransport::Sse(t) => t.close().await,
            AnyTransport::WebSocket(t) => t.close().await,
            AnyTransport::StreamableHttp(t) => t.close().await,
            AnyTransport::Memory(t) => t.close().await,
        }
    }
}

impl From<memory::MemoryTransport> for AnyTransport {
    fn from(t: memory::MemoryTransport) -> Self {
        AnyTransport::Memory(t)
    }
}

/// Stream items from a receiver shared between `receive` calls.
///
/// The lock is held only while waiting for one item, so a stream dropped
/// mid-wait releases the receiver for the next caller.
pub(crate) fn shared_receiver_stream(
    rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
) -> MessageStream<'static> {
    Box::pin(futures::stream::unfold(rx, |rx| async move {
        let mut guard = rx.lock().await;
        let item = guard.recv().await?;
        drop(guard);
        Some((item, rx))
    }))
}

/// End `stream` as soon as `token` is cancelled.
pub(crate) fn until_cancelled(
    stream: MessageStream<'static>,
    token: tokio_util::sync::CancellationToken,
) -> MessageStream<'static> {
    use futures::StreamExt;
    Box::pin(stream.take_until(token.cancelled_owned()))
}

/// Wrap a send failure into [`ConduitError::Transport`].
pub(crate) fn channel_closed(what: &str) -> anyhow::Error {
    ConduitError::Transport(format!("{what} channel closed")).into()
}

/// Map a spawn or connect failure for `server` into [`ConduitError::Connection`].
pub(crate) fn connect_error(server: &str, message: impl std::fmt::Display) -> anyhow::Error {
    ConduitError::Connection {
        server: server.to_string(),
        message: message.to_string(),
    }
    .into()
}
