//! In-process transport pair
//!
//! [`MemoryTransport::pair`] returns the client half and a [`MemoryPeer`]
//! that plays the server. Nothing leaves the process, which makes the pair
//! the natural seam for session tests and for embedding a server in the
//! same binary.
//!
//! ```text
//! client send() ----> outbound_tx ----> peer.outbound_rx
//! peer.inbound_tx --> inbound_rx  ----> client receive()
//! ```
//!
//! Dropping the peer's `inbound_tx` ends the client's `receive` stream,
//! which is how tests simulate a server going away.
//!
//! # Example
//!
//! ```
//! use conduit::mcp::transport::memory::MemoryTransport;
//! use conduit::mcp::transport::Transport;
//! use futures::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let (transport, mut peer) = MemoryTransport::pair();
//! transport.send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string()).await.unwrap();
//! assert!(peer.outbound_rx.recv().await.unwrap().contains("ping"));
//!
//! peer.inbound_tx.send(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_string()).unwrap();
//! assert!(transport.receive().next().await.unwrap().contains("result"));
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::mcp::transport::{
    channel_closed, shared_receiver_stream, until_cancelled, MessageStream, Transport,
};

/// Client half of an in-process transport pair.
#[derive(Debug)]
pub struct MemoryTransport {
    outbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    shutdown: CancellationToken,
}

/// Server half of a [`MemoryTransport`] pair.
#[derive(Debug)]
pub struct MemoryPeer {
    /// Messages the client sent.
    pub outbound_rx: mpsc::UnboundedReceiver<String>,
    /// Messages delivered to the client's `receive` stream.
    pub inbound_tx: mpsc::UnboundedSender<String>,
}

impl MemoryPeer {
    /// Next client message parsed as JSON, or `None` once the client is gone.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let raw = self.outbound_rx.recv().await?;
        serde_json::from_str(&raw).ok()
    }

    /// Deliver a JSON value to the client. Returns `false` if the client is gone.
    pub fn send_json(&self, value: serde_json::Value) -> bool {
        self.inbound_tx.send(value.to_string()).is_ok()
    }
}

impl MemoryTransport {
    /// Create a connected `(transport, peer)` pair.
    pub fn pair() -> (Self, MemoryPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound_tx,
                inbound_rx: Arc::new(Mutex::new(inbound_rx)),
                shutdown: CancellationToken::new(),
            },
            MemoryPeer {
                outbound_rx,
                inbound_tx,
            },
        )
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: String) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(channel_closed("memory"));
        }
        self.outbound_tx
            .send(message)
            .map_err(|_| channel_closed("memory"))
    }

    fn receive(&self) -> MessageStream<'_> {
        until_cancelled(
            shared_receiver_stream(Arc::clone(&self.inbound_rx)),
            self.shutdown.clone(),
        )
    }

    fn receive_err(&self) -> MessageStream<'_> {
        Box::pin(futures::stream::empty())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        Ok(())
    }
}
