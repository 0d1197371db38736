//! Streamable HTTP transport for MCP
//!
//! [`HttpTransport`] sends every outbound JSON-RPC message as an HTTP POST.
//! The server replies with one of:
//!
//! - `application/json` -- a single message (or a JSON array batch)
//! - `text/event-stream` -- an SSE stream carrying one or more messages,
//!   including server requests such as `elicitation/create` that belong to
//!   the in-flight call
//! - `202 Accepted` -- acknowledgement with no body
//!
//! # Session management
//!
//! An `MCP-Session-Id` response header is stored and echoed on every later
//! request. A `404` while a session is active means the server forgot the
//! session; the id is cleared and the send fails with
//! [`ConduitError::ConnectionLost`].
//!
//! # Server push
//!
//! The first `202` starts a background task holding a GET event stream
//! open for server-initiated messages. When that stream ends for any reason
//! other than the transport closing, it is reopened after a backoff with
//! `Last-Event-ID` set to the last event id seen. A `405` means the server
//! offers no such stream.
//!
//! # Timeouts
//!
//! `http_timeout_seconds` bounds connect plus response headers.
//! `read_timeout_seconds` bounds idle time between body chunks; see
//! [`crate::mcp::transport::event_stream`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{ConduitError, Result};
use crate::mcp::config::{ReconnectPolicy, ServerConfig};
use crate::mcp::transport::event_stream::{pump_events, PumpEnd};
use crate::mcp::transport::{
    connect_error, shared_receiver_stream, until_cancelled, MessageStream, Transport,
};
use crate::mcp::types::LATEST_PROTOCOL_VERSION;

const SESSION_HEADER: &str = "MCP-Session-Id";
const PROTOCOL_HEADER: &str = "MCP-Protocol-Version";
const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Streamable HTTP transport.
///
/// # Examples
///
/// ```no_run
/// use conduit::mcp::config::{ServerConfig, TransportKind};
/// use conduit::mcp::transport::http::HttpTransport;
///
/// let cfg = ServerConfig::network("remote", TransportKind::StreamableHttp, "http://localhost:3000/mcp");
/// let transport = HttpTransport::from_config(&cfg).unwrap();
/// ```
#[derive(Debug)]
pub struct HttpTransport {
    server: String,
    http_client: reqwest::Client,
    endpoint: url::Url,
    session_id: Arc<RwLock<Option<String>>>,
    headers: HashMap<String, String>,
    http_timeout: Duration,
    read_timeout: Duration,
    response_tx: mpsc::UnboundedSender<String>,
    response_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    error_tx: mpsc::UnboundedSender<String>,
    error_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    last_event_id: Arc<RwLock<Option<String>>>,
    get_stream_started: AtomicBool,
    shutdown: CancellationToken,
}

impl HttpTransport {
    /// Build a transport for a `streamable_http` server. No I/O is performed.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Config`] for a bad URL and
    /// [`ConduitError::Connection`] if the HTTP client cannot be built.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let endpoint = config.parsed_url()?;
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.http_timeout())
            .build()
            .map_err(|e| connect_error(&config.name, format!("building HTTP client: {e}")))?;

        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        Ok(Self {
            server: config.name.clone(),
            http_client,
            endpoint,
            session_id: Arc::new(RwLock::new(None)),
            headers: config.effective_headers(),
            http_timeout: config.http_timeout(),
            read_timeout: config.read_timeout(),
            response_tx,
            response_rx: Arc::new(Mutex::new(response_rx)),
            error_tx,
            error_rx: Arc::new(Mutex::new(error_rx)),
            last_event_id: Arc::new(RwLock::new(None)),
            get_stream_started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Session id assigned by the server, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    /// Id of the last event received on the GET stream.
    pub async fn last_event_id(&self) -> Option<String> {
        self.last_event_id.read().await.clone()
    }

    async fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref id) = *self.session_id.read().await {
            req = req.header(SESSION_HEADER, id.as_str());
        }
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }

    async fn dispatch(&self, req: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        dispatch(&self.server, self.http_timeout, req, what).await
    }

    /// Spawn a task forwarding an SSE response body to `receive()`.
    fn spawn_event_pump(&self, response: reqwest::Response) {
        let server = self.server.clone();
        let tx = self.response_tx.clone();
        let error_tx = self.error_tx.clone();
        let idle = self.read_timeout;
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            let (end, _) = forward_events(&server, response, idle, &tx, &token).await;
            match end {
                PumpEnd::Finished | PumpEnd::Stopped => {}
                PumpEnd::Idle => {
                    let _ = error_tx.send("event stream idle; closed".to_string());
                }
                PumpEnd::Failed(e) => {
                    tracing::warn!(server = %server, error = %e, "event stream failed");
                    let _ = error_tx.send(format!("event stream failed: {e}"));
                }
            }
        });
    }

    /// Start the background task that keeps the GET event stream open.
    ///
    /// Only the first call has an effect.
    pub fn start_get_stream(&self) {
        if self.get_stream_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let stream = GetStream {
            server: self.server.clone(),
            http_client: self.http_client.clone(),
            endpoint: self.endpoint.clone(),
            session_id: Arc::clone(&self.session_id),
            headers: self.headers.clone(),
            http_timeout: self.http_timeout,
            read_timeout: self.read_timeout,
            tx: self.response_tx.clone(),
            error_tx: self.error_tx.clone(),
            last_event_id: Arc::clone(&self.last_event_id),
            shutdown: self.shutdown.clone(),
            retry: ReconnectPolicy::default(),
        };
        tokio::spawn(stream.run());
    }
}

/// Send a request, bounding connect plus headers by `http_timeout`.
async fn dispatch(
    server: &str,
    http_timeout: Duration,
    req: reqwest::RequestBuilder,
    what: &str,
) -> Result<reqwest::Response> {
    match tokio::time::timeout(http_timeout, req.send()).await {
        Ok(Ok(resp)) => Ok(resp),
        Ok(Err(e)) if e.is_connect() => Err(connect_error(server, e)),
        Ok(Err(e)) => Err(ConduitError::Transport(format!("HTTP {what} failed: {e}")).into()),
        Err(_) => Err(ConduitError::Timeout {
            server: server.to_string(),
            method: what.to_string(),
            after: http_timeout,
        }
        .into()),
    }
}

/// Forward the events of an SSE body to `tx` until it ends.
///
/// Returns why the body ended and the id of the last event that carried one.
async fn forward_events(
    server: &str,
    response: reqwest::Response,
    idle: Duration,
    tx: &mpsc::UnboundedSender<String>,
    token: &CancellationToken,
) -> (PumpEnd, Option<String>) {
    let mut latest_id: Option<String> = None;
    let end = {
        let pump = pump_events(server, response.bytes_stream(), Some(idle), |event| {
            if event.id.is_some() {
                latest_id = event.id.clone();
            }
            if event.data.is_empty() {
                return true;
            }
            tx.send(event.data).is_ok()
        });
        tokio::select! {
            _ = token.cancelled() => PumpEnd::Stopped,
            end = pump => end,
        }
    };
    (end, latest_id)
}

/// The GET event stream of one transport, run on its own task.
#[derive(Debug)]
struct GetStream {
    server: String,
    http_client: reqwest::Client,
    endpoint: url::Url,
    session_id: Arc<RwLock<Option<String>>>,
    headers: HashMap<String, String>,
    http_timeout: Duration,
    read_timeout: Duration,
    tx: mpsc::UnboundedSender<String>,
    error_tx: mpsc::UnboundedSender<String>,
    last_event_id: Arc<RwLock<Option<String>>>,
    shutdown: CancellationToken,
    retry: ReconnectPolicy,
}

impl GetStream {
    /// Issue the GET. `Ok(None)` means the server offers no event stream.
    async fn open(&self) -> Result<Option<reqwest::Response>> {
        let mut req = self
            .http_client
            .get(self.endpoint.as_str())
            .header("Accept", "text/event-stream")
            .header(PROTOCOL_HEADER, LATEST_PROTOCOL_VERSION);
        if let Some(ref id) = *self.session_id.read().await {
            req = req.header(SESSION_HEADER, id.as_str());
        }
        if let Some(ref id) = *self.last_event_id.read().await {
            req = req.header(LAST_EVENT_ID_HEADER, id.as_str());
        }
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let response = dispatch(&self.server, self.http_timeout, req, "GET").await?;
        let status = response.status();
        if status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ConduitError::Transport(format!("GET stream returned HTTP {status}")).into());
        }
        Ok(Some(response))
    }

    /// Keep the stream open until the transport closes, the server refuses
    /// it, or `retry.max_attempts` consecutive opens fail.
    async fn run(self) {
        let mut failures = 0u32;
        loop {
            let delay = match self.open().await {
                Ok(None) => {
                    tracing::debug!(server = %self.server, "server offers no GET event stream");
                    return;
                }
                Ok(Some(response)) => {
                    failures = 0;
                    let (end, latest_id) =
                        forward_events(&self.server, response, self.read_timeout, &self.tx, &self.shutdown)
                            .await;
                    if let Some(id) = latest_id {
                        *self.last_event_id.write().await = Some(id);
                    }
                    match end {
                        PumpEnd::Stopped => return,
                        PumpEnd::Finished => {
                            tracing::debug!(server = %self.server, "GET event stream ended; reopening");
                        }
                        PumpEnd::Idle => {
                            tracing::debug!(server = %self.server, "GET event stream idle; reopening");
                        }
                        PumpEnd::Failed(e) => {
                            tracing::warn!(server = %self.server, error = %e, "GET event stream failed; reopening");
                        }
                    }
                    self.retry.backoff(0)
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.retry.max_attempts {
                        tracing::warn!(server = %self.server, error = %e, "giving up on GET event stream");
                        let _ = self.error_tx.send(format!("GET event stream unavailable: {e}"));
                        return;
                    }
                    tracing::debug!(server = %self.server, error = %e, attempt = failures, "GET event stream open failed");
                    self.retry.backoff(failures - 1)
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(&self, message: String) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ConduitError::Transport("transport closed".to_string()).into());
        }

        let req = self
            .http_client
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header(PROTOCOL_HEADER, LATEST_PROTOCOL_VERSION)
            .body(message);
        let req = self.apply_headers(req).await;
        let response = self.dispatch(req, "POST").await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let www_auth = response
                .headers()
                .get("WWW-Authenticate")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            return Err(ConduitError::Auth(www_auth).into());
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            let mut sid = self.session_id.write().await;
            if sid.take().is_some() {
                tracing::warn!(server = %self.server, "MCP session expired");
                return Err(ConduitError::ConnectionLost {
                    server: self.server.clone(),
                }
                .into());
            }
            return Err(ConduitError::Transport("HTTP 404 Not Found".into()).into());
        }

        if !status.is_success() {
            return Err(ConduitError::Transport(format!("HTTP POST returned status {status}")).into());
        }

        if let Some(new_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        {
            let mut sid = self.session_id.write().await;
            if sid.is_none() {
                tracing::debug!(server = %self.server, session = %new_id, "MCP session established");
                *sid = Some(new_id);
            }
        }

        if status == reqwest::StatusCode::ACCEPTED {
            // The first accepted notification is `notifications/initialized`;
            // from here on the server may push on the GET stream.
            self.start_get_stream();
            return Ok(());
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            self.spawn_event_pump(response);
            return Ok(());
        }

        let body = match tokio::time::timeout(self.read_timeout, response.text()).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                return Err(
                    ConduitError::Transport(format!("failed to read response body: {e}")).into(),
                )
            }
            Err(_) => {
                return Err(ConduitError::Timeout {
                    server: self.server.clone(),
                    method: "POST body".to_string(),
                    after: self.read_timeout,
                }
                .into())
            }
        };
        for message in split_json_body(&body) {
            let _ = self.response_tx.send(message);
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
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();

        let Some(sid) = self.session_id.write().await.take() else {
            return Ok(());
        };
        let mut req = self
            .http_client
            .delete(self.endpoint.as_str())
            .header(SESSION_HEADER, sid.as_str());
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let response = self.dispatch(req, "DELETE").await?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            Ok(())
        } else {
            Err(ConduitError::Transport(format!("session DELETE returned HTTP {status}")).into())
        }
    }
}

impl Drop for HttpTransport {
    /// Best-effort session termination when `close` was never called.
    fn drop(&mut self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let Ok(guard) = self.session_id.try_read() else {
            return;
        };
        let Some(sid) = guard.clone() else { return };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut req = self
            .http_client
            .delete(self.endpoint.as_str())
            .header(SESSION_HEADER, sid)
            .timeout(self.http_timeout);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        handle.spawn(async move {
            let _ = req.send().await;
        });
    }
}

/// Split a JSON response body into individual messages.
///
/// A JSON array is a batch; anything else is forwarded as one message.
fn split_json_body(body: &str) -> Vec<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[') {
        if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(trimmed) {
            return items.iter().map(|v| v.to_string()).collect();
        }
    }
    vec![trimmed.to_string()]
}
