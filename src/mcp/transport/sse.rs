//! Legacy HTTP+SSE transport for MCP
//!
//! The client opens a long-lived GET event stream. The server's first event
//! is `endpoint`, whose data is the URL (usually relative) that every
//! outbound message must be POSTed to. Responses and server requests then
//! arrive as `message` events on the original stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{ConduitError, Result};
use crate::mcp::config::ServerConfig;
use crate::mcp::transport::event_stream::{pump_events, PumpEnd};
use crate::mcp::transport::{
    connect_error, shared_receiver_stream, until_cancelled, MessageStream, Transport,
};

/// Legacy HTTP+SSE transport.
#[derive(Debug)]
pub struct SseTransport {
    server: String,
    http_client: reqwest::Client,
    endpoint: url::Url,
    headers: HashMap<String, String>,
    http_timeout: Duration,
    response_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    error_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    shutdown: CancellationToken,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` announcement.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Connection`] if the stream cannot be opened or
    /// no endpoint is announced within `http_timeout_seconds`, and
    /// [`ConduitError::Auth`] on HTTP 401.
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let base = config.parsed_url()?;
        let http_timeout = config.http_timeout();
        let headers = config.effective_headers();
        let http_client = reqwest::Client::builder()
            .connect_timeout(http_timeout)
            .build()
            .map_err(|e| connect_error(&config.name, format!("building HTTP client: {e}")))?;

        let mut req = http_client
            .get(base.as_str())
            .header("Accept", "text/event-stream");
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let response = match tokio::time::timeout(http_timeout, req.send()).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(connect_error(&config.name, e)),
            Err(_) => {
                return Err(connect_error(
                    &config.name,
                    format!("no response from {base} within {http_timeout:?}"),
                ))
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ConduitError::Auth(format!("{base} rejected credentials")).into());
        }
        if !status.is_success() {
            return Err(connect_error(
                &config.name,
                format!("event stream returned HTTP {status}"),
            ));
        }

        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<url::Url>();
        let shutdown = CancellationToken::new();

        let server = config.name.clone();
        let read_timeout = config.read_timeout();
        let token = shutdown.clone();
        let stream_base = base.clone();
        tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let end = {
                let pump = pump_events(&server, response.bytes_stream(), Some(read_timeout), |event| {
                    match event.kind() {
                        "endpoint" => {
                            match stream_base.join(event.data.trim()) {
                                Ok(url) => {
                                    tracing::debug!(server = %server, endpoint = %url, "SSE endpoint announced");
                                    if let Some(tx) = endpoint_tx.take() {
                                        let _ = tx.send(url);
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(server = %server, error = %e, "unusable SSE endpoint");
                                }
                            }
                            true
                        }
                        "message" => event.data.is_empty() || response_tx.send(event.data).is_ok(),
                        other => {
                            tracing::debug!(server = %server, event = other, "ignoring SSE event");
                            true
                        }
                    }
                });
                tokio::select! {
                    _ = token.cancelled() => PumpEnd::Stopped,
                    end = pump => end,
                }
            };
            match end {
                PumpEnd::Finished | PumpEnd::Stopped => {}
                PumpEnd::Idle => {
                    let _ = error_tx.send("event stream idle; closed".to_string());
                }
                PumpEnd::Failed(e) => {
                    tracing::warn!(server = %server, error = %e, "SSE stream failed");
                    let _ = error_tx.send(format!("event stream failed: {e}"));
                }
            }
        });

        let endpoint = match tokio::time::timeout(http_timeout, endpoint_rx).await {
            Ok(Ok(url)) => url,
            Ok(Err(_)) => {
                shutdown.cancel();
                return Err(connect_error(
                    &config.name,
                    "event stream ended before an endpoint was announced",
                ));
            }
            Err(_) => {
                shutdown.cancel();
                return Err(connect_error(
                    &config.name,
                    format!("no endpoint event within {http_timeout:?}"),
                ));
            }
        };

        Ok(Self {
            server: config.name.clone(),
            http_client,
            endpoint,
            headers,
            http_timeout,
            response_rx: Arc::new(Mutex::new(response_rx)),
            error_rx: Arc::new(Mutex::new(error_rx)),
            shutdown,
        })
    }

    /// URL announced by the server for outbound messages.
    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl Transport for SseTransport {
    async fn send(&self, message: String) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ConduitError::Transport("transport closed".to_string()).into());
        }
        let mut req = self
            .http_client
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/json")
            .body(message);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let response = match tokio::time::timeout(self.http_timeout, req.send()).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(ConduitError::Transport(format!("HTTP POST failed: {e}")).into()),
            Err(_) => {
                return Err(ConduitError::Timeout {
                    server: self.server.clone(),
                    method: "POST".to_string(),
                    after: self.http_timeout,
                }
                .into())
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ConduitError::Auth(format!("{} rejected credentials", self.endpoint)).into());
        }
        if !status.is_success() {
            return Err(ConduitError::Transport(format!("HTTP POST returned status {status}")).into());
        }
        Ok(())
    }

    fn receive(&self) -> MessageStream<'_> {
        until_cancelled(
            shared_receiver_stream(Arc::clone(&self.response_rx)),
            self.shutdown.clone(),
        )
    }

    fn receive_err(&self) -> MessageStream<'_> {
        shared_receiver_stream(Arc::clone(&self.error_rx))
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
