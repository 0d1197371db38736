//! One live connection to one MCP server
//!
//! A [`Session`] owns a transport, the JSON-RPC correlation table, and the
//! capability cache for a single configured server, and walks the state
//! machine
//!
//! ```text
//! Disconnected -> Connecting -> Initializing -> Ready <-> Degraded
//!                                                 \          \
//!                                                  +-> Closing -> Closed
//! ```
//!
//! # Tasks
//!
//! Each connection runs a writer task (outbound channel to transport), a
//! pump task (transport to inbound channel), and the JSON-RPC read loop. A
//! supervisor task per session waits for the read loop to end and decides
//! between reconnecting and closing. Server-initiated requests are handled
//! on their own tasks by [`crate::mcp::client`].
//!
//! # Failure handling
//!
//! - A request timeout fails only that call; the session stays `Ready`.
//!   [`DEGRADE_AFTER`] consecutive transient failures move it to `Degraded`,
//!   and the next success moves it back.
//! - When the connection drops, every pending request fails with
//!   [`ConduitError::ConnectionLost`], all caches are invalidated, and up to
//!   `reconnect.max_attempts` reconnects are made with exponential backoff.
//! - A malformed inbound message, or a result that breaks the protocol,
//!   closes the session without reconnecting. Pending requests fail with
//!   [`ConduitError::Protocol`].
//! - `Closed` is final. Once the session starts closing, a reconnect that is
//!   still in flight is discarded instead of reviving it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ConduitError, Result};
use crate::mcp::cache::{CapabilityCache, CapabilityKind};
use crate::mcp::client::{start_read_loop, BoxFuture, JsonRpcClient, LoopExit};
use crate::mcp::config::{McpConfig, ReconnectPolicy, ServerConfig};
use crate::mcp::elicitation::{self, ElicitationHandler};
use crate::mcp::metrics;
use crate::mcp::protocol::{capable, McpProtocol, ServerCapabilityFlag};
use crate::mcp::transport::{AnyTransport, Transport};
use crate::mcp::types::{
    CallToolResponse, CancelledParams, ClientCapabilities, ElicitationCapability,
    GetPromptResponse, Implementation, InitializeResponse, ListRootsResult, LoggingLevel,
    LoggingMessageParams, McpTool, Prompt, Resource, ResourceContents, Root, RootsCapability,
    METHOD_ELICITATION_CREATE, METHOD_PING, METHOD_ROOTS_LIST, NOTIF_CANCELLED, NOTIF_MESSAGE,
    NOTIF_PROGRESS, NOTIF_PROMPTS_LIST_CHANGED, NOTIF_RESOURCES_LIST_CHANGED,
    NOTIF_TOOLS_LIST_CHANGED,
};

/// Consecutive transient failures that move a `Ready` session to `Degraded`.
pub const DEGRADE_AFTER: u32 = 3;

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Initializing,
    Ready,
    Degraded,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether requests may be issued in this state.
    pub fn accepts_requests(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Degraded)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Opens a transport for a server. Replaceable for tests and embedding.
pub type Connector =
    Arc<dyn Fn(Arc<ServerConfig>) -> BoxFuture<'static, Result<AnyTransport>> + Send + Sync>;

/// The connector used unless one is supplied: [`AnyTransport::connect`].
pub fn default_connector() -> Connector {
    Arc::new(
        |config: Arc<ServerConfig>| -> BoxFuture<'static, Result<AnyTransport>> {
            Box::pin(async move { AnyTransport::connect(&config).await })
        },
    )
}

/// Options shared by every session a registry creates.
#[derive(Clone)]
pub struct SessionOptions {
    pub client_info: Implementation,
    pub reconnect: ReconnectPolicy,
    pub elicitation: Option<Arc<dyn ElicitationHandler>>,
    pub connector: Connector,
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("client_info", &self.client_info)
            .field("reconnect", &self.reconnect)
            .field("elicitation", &self.elicitation.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_info: Implementation {
                name: "conduit".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
            },
            reconnect: ReconnectPolicy::default(),
            elicitation: None,
            connector: default_connector(),
        }
    }
}

impl SessionOptions {
    /// Options carrying the client name and reconnect policy from `config`.
    pub fn from_config(config: &McpConfig) -> Self {
        let mut options = Self::default();
        options.client_info.name = config.client_name.clone();
        options.reconnect = config.reconnect.clone();
        options
    }

    pub fn with_elicitation_handler(mut self, handler: Arc<dyn ElicitationHandler>) -> Self {
        self.elicitation = Some(handler);
        self
    }

    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = connector;
        self
    }
}

/// Wiring of the current transport.
struct Link {
    transport: Arc<AnyTransport>,
    token: CancellationToken,
}

/// A live session with one MCP server.
pub struct Session {
    config: Arc<ServerConfig>,
    options: SessionOptions,
    client: Arc<JsonRpcClient>,
    protocol: McpProtocol,
    state_tx: watch::Sender<SessionState>,
    cache: Arc<CapabilityCache>,
    list_lock: Mutex<()>,
    server_info: RwLock<Option<InitializeResponse>>,
    link: Mutex<Option<Link>>,
    shutdown: CancellationToken,
    closing: AtomicBool,
    transient_failures: AtomicU32,
    reconnecting: AtomicBool,
    ready_transitions: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.config.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect, initialize, and start supervising a session.
    ///
    /// Connection failures are retried with backoff; a failed handshake is
    /// not.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Connection`] when every connection attempt
    /// fails, [`ConduitError::ProtocolVersion`] or
    /// [`ConduitError::Protocol`] when the handshake fails, and
    /// [`ConduitError::Timeout`] if the server never answers `initialize`.
    pub async fn start(config: ServerConfig, options: SessionOptions) -> Result<Arc<Self>> {
        let session = Arc::new(Self::new(config, options));
        session.register_handlers();

        let loop_handle = match session.establish(session.options.reconnect.max_attempts).await {
            Ok(handle) => handle,
            Err(e) => {
                session.set_state(SessionState::Closed);
                tracing::warn!(server = %session.name(), error = %e, "session failed to start");
                return Err(e);
            }
        };

        tokio::spawn(supervise(Arc::downgrade(&session), loop_handle));
        Ok(session)
    }

    fn new(config: ServerConfig, options: SessionOptions) -> Self {
        let config = Arc::new(config);
        // Replaced by the first connection's writer channel.
        let (placeholder_tx, _) = mpsc::unbounded_channel();
        let client = Arc::new(JsonRpcClient::new(config.name.clone(), placeholder_tx));
        let protocol = McpProtocol::new(Arc::clone(&client), config.read_timeout());
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            options,
            client,
            protocol,
            state_tx,
            cache: Arc::new(CapabilityCache::default()),
            list_lock: Mutex::new(()),
            server_info: RwLock::new(None),
            link: Mutex::new(None),
            shutdown: CancellationToken::new(),
            closing: AtomicBool::new(false),
            transient_failures: AtomicU32::new(0),
            reconnecting: AtomicBool::new(false),
            ready_transitions: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// How many times the session has entered `Ready` from a fresh connection.
    pub fn ready_transitions(&self) -> u64 {
        self.ready_transitions.load(Ordering::SeqCst)
    }

    /// The server's `initialize` result for the current connection.
    pub fn server_info(&self) -> Option<InitializeResponse> {
        self.server_info
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Publish a state change.
    ///
    /// `Closed` is final and `Closing` only moves to `Closed`. After shutdown
    /// has fired no other state can be entered.
    fn set_state(&self, next: SessionState) {
        let shutting_down = self.shutdown.is_cancelled();
        let mut previous = next;
        let changed = self.state_tx.send_if_modified(|state| {
            previous = *state;
            let allowed = match *state {
                SessionState::Closed => false,
                SessionState::Closing => next == SessionState::Closed,
                _ => !shutting_down || matches!(next, SessionState::Closing | SessionState::Closed),
            };
            if !allowed || *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            tracing::info!(server = %self.config.name, from = %previous, to = %next, "session state changed");
            metrics::record_transition(&self.config.name, next);
        } else if previous != next {
            tracing::debug!(server = %self.config.name, state = %previous, ignored = %next, "state change ignored");
        }
    }

    fn client_capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            roots: (!self.config.roots.is_empty()).then(|| RootsCapability {
                list_changed: Some(false),
            }),
            elicitation: self.options.elicitation.as_ref().map(|_| ElicitationCapability {
                form: Some(serde_json::json!({})),
            }),
            experimental: None,
        }
    }

    /// Install server-request and notification handlers on the client.
    ///
    /// Handlers hold only weak or shared pieces, never the session itself.
    fn register_handlers(&self) {
        let client = &self.client;

        client.on_server_request(METHOD_PING, |_| Box::pin(async { Ok(serde_json::json!({})) }));

        let roots: Vec<Root> = self.config.roots.iter().map(Root::from).collect();
        client.on_server_request(METHOD_ROOTS_LIST, move |_| {
            let result = ListRootsResult {
                roots: roots.clone(),
            };
            Box::pin(async move {
                serde_json::to_value(result).map_err(|e| {
                    crate::mcp::types::JsonRpcError::new(
                        crate::mcp::types::INTERNAL_ERROR,
                        e.to_string(),
                    )
                })
            })
        });

        if let Some(handler) = self.options.elicitation.clone() {
            let weak = Arc::downgrade(client);
            client.on_server_request(METHOD_ELICITATION_CREATE, move |params| {
                let handler = Arc::clone(&handler);
                let weak = Weak::clone(&weak);
                Box::pin(async move {
                    let Some(client) = weak.upgrade() else {
                        return Err(crate::mcp::types::JsonRpcError::new(
                            crate::mcp::types::INTERNAL_ERROR,
                            "session closed",
                        ));
                    };
                    elicitation::coordinate(&client, handler.as_ref(), params).await
                })
            });
        }

        for (method, kind) in [
            (NOTIF_TOOLS_LIST_CHANGED, CapabilityKind::Tools),
            (NOTIF_RESOURCES_LIST_CHANGED, CapabilityKind::Resources),
            (NOTIF_PROMPTS_LIST_CHANGED, CapabilityKind::Prompts),
        ] {
            let cache = Arc::clone(&self.cache);
            let server = self.config.name.clone();
            client.on_notification(method, move |_| {
                tracing::debug!(server = %server, kind = %kind, "server list changed");
                cache.invalidate(kind);
            });
        }

        let server = self.config.name.clone();
        client.on_notification(NOTIF_MESSAGE, move |params| log_server_message(&server, params));

        let server = self.config.name.clone();
        client.on_notification(NOTIF_CANCELLED, move |params| {
            let params: Option<CancelledParams> = serde_json::from_value(params).ok();
            tracing::debug!(server = %server, params = ?params, "server cancelled a request");
        });

        let server = self.config.name.clone();
        client.on_notification(NOTIF_PROGRESS, move |params| {
            tracing::trace!(server = %server, progress = %params, "progress");
        });
    }

    /// Open a transport, retrying connection failures with backoff.
    async fn open_transport(&self, retries: u32) -> Result<AnyTransport> {
        let mut attempt = 0;
        loop {
            match (self.options.connector)(Arc::clone(&self.config)).await {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    let retryable = matches!(
                        crate::error::classify(&e),
                        Some(ConduitError::Connection { .. })
                    );
                    if !retryable || attempt >= retries || self.shutdown.is_cancelled() {
                        return Err(e);
                    }
                    let delay = self.options.reconnect.backoff(attempt);
                    tracing::warn!(
                        server = %self.config.name,
                        error = %e,
                        attempt = attempt + 1,
                        retry_in = ?delay,
                        "connection failed; retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Connect, wire, and initialize. On success the session is `Ready`.
    async fn establish(&self, retries: u32) -> Result<JoinHandle<LoopExit>> {
        self.set_state(SessionState::Connecting);
        let transport = Arc::new(self.open_transport(retries).await?);
        if self.shutdown.is_cancelled() {
            self.discard(&transport).await;
            return Err(self.connection_lost().into());
        }
        tracing::debug!(server = %self.config.name, transport = transport.kind(), "transport open");

        self.set_state(SessionState::Initializing);
        let token = self.shutdown.child_token();
        let loop_handle = self.wire(Arc::clone(&transport), token.clone());

        let init = self
            .protocol
            .initialize(self.options.client_info.clone(), self.client_capabilities())
            .await;
        let response = match init {
            Ok(response) => response,
            Err(e) => {
                token.cancel();
                self.client.fail_all(|_| self.connection_lost());
                self.discard(&transport).await;
                return Err(e);
            }
        };

        // close() cancels before it takes the link, so a link stored here is
        // always seen and released by it.
        let mut link = self.link.lock().await;
        if self.shutdown.is_cancelled() {
            drop(link);
            token.cancel();
            self.discard(&transport).await;
            return Err(self.connection_lost().into());
        }
        *link = Some(Link { transport, token });
        drop(link);

        tracing::info!(
            server = %self.config.name,
            protocol = %response.protocol_version,
            server_name = %response.server_info.name,
            server_version = %response.server_info.version,
            "session initialized"
        );
        *self.server_info.write().unwrap_or_else(|p| p.into_inner()) = Some(response);
        self.transient_failures.store(0, Ordering::SeqCst);
        self.ready_transitions.fetch_add(1, Ordering::SeqCst);
        self.set_state(SessionState::Ready);
        Ok(loop_handle)
    }

    /// Spawn the writer, pump, and read loop for one transport.
    fn wire(&self, transport: Arc<AnyTransport>, token: CancellationToken) -> JoinHandle<LoopExit> {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        self.client.set_outbound(out_tx);

        let server = self.config.name.clone();
        let writer_transport = Arc::clone(&transport);
        let writer_token = token.clone();
        let client = Arc::downgrade(&self.client);
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = writer_token.cancelled() => break,
                    message = out_rx.recv() => match message {
                        Some(m) => m,
                        None => break,
                    },
                };
                let request_id = outbound_request_id(&message);
                if let Err(e) = writer_transport.send(message).await {
                    tracing::warn!(server = %server, error = %e, "transport send failed");
                    let error = e
                        .downcast::<ConduitError>()
                        .unwrap_or_else(|e| ConduitError::Transport(e.to_string()));
                    let lost = matches!(error, ConduitError::ConnectionLost { .. });
                    if let (Some(id), Some(client)) = (request_id, client.upgrade()) {
                        client.fail_request(id, error);
                    }
                    if lost {
                        writer_token.cancel();
                        break;
                    }
                }
            }
        });

        let server = self.config.name.clone();
        let pump_transport = Arc::clone(&transport);
        let pump_token = token.clone();
        tokio::spawn(async move {
            let mut inbound = pump_transport.receive();
            loop {
                tokio::select! {
                    _ = pump_token.cancelled() => break,
                    item = inbound.next() => match item {
                        Some(message) => {
                            if in_tx.send(message).is_err() {
                                break;
                            }
                        }
                        None => {
                            tracing::debug!(server = %server, "transport receive stream ended");
                            break;
                        }
                    },
                }
            }
        });

        let server = self.config.name.clone();
        let diag_token = token.clone();
        tokio::spawn(async move {
            let mut diagnostics = transport.receive_err();
            loop {
                tokio::select! {
                    _ = diag_token.cancelled() => break,
                    line = diagnostics.next() => match line {
                        Some(line) => tracing::debug!(server = %server, line = %line, "transport diagnostic"),
                        None => break,
                    },
                }
            }
        });

        start_read_loop(in_rx, token, Arc::clone(&self.client))
    }

    /// Reconnect after the connection dropped. Returns the new read loop.
    async fn reconnect(&self) -> Result<JoinHandle<LoopExit>> {
        let policy = &self.options.reconnect;
        let mut last_error = ConduitError::ConnectionLost {
            server: self.config.name.clone(),
        }
        .into();
        for attempt in 0..policy.max_attempts {
            let delay = policy.backoff(attempt);
            tracing::info!(
                server = %self.config.name,
                attempt = attempt + 1,
                max = policy.max_attempts,
                delay = ?delay,
                "reconnecting"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(last_error),
                _ = tokio::time::sleep(delay) => {}
            }
            match self.establish(0).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    tracing::warn!(server = %self.config.name, error = %e, "reconnect attempt failed");
                    if self.shutdown.is_cancelled() {
                        return Err(e);
                    }
                    self.set_state(SessionState::Degraded);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Close a transport that will not be used.
    async fn discard(&self, transport: &AnyTransport) {
        if let Err(e) = transport.close().await {
            tracing::debug!(server = %self.config.name, error = %e, "transport close failed");
        }
    }

    /// Tear down the current link after the read loop ended.
    async fn drop_link(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.token.cancel();
            if let Err(e) = link.transport.close().await {
                tracing::debug!(server = %self.config.name, error = %e, "transport close failed");
            }
        }
    }

    fn connection_lost(&self) -> ConduitError {
        ConduitError::ConnectionLost {
            server: self.config.name.clone(),
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        let state = self.state();
        if state.accepts_requests() && !self.reconnecting.load(Ordering::SeqCst) {
            return Ok(());
        }
        Err(ConduitError::NotReady {
            server: self.config.name.clone(),
            state: state.to_string(),
        }
        .into())
    }

    /// Update the transient-failure streak from a request outcome.
    ///
    /// A protocol violation closes the session.
    async fn track<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => {
                self.transient_failures.store(0, Ordering::SeqCst);
                if self.state() == SessionState::Degraded && !self.reconnecting.load(Ordering::SeqCst) {
                    self.set_state(SessionState::Ready);
                }
            }
            Err(e) => {
                if let Some(ConduitError::Protocol { message, .. }) = crate::error::classify(e) {
                    let reason = message.clone();
                    self.abandon(&reason).await;
                    return result;
                }
                let transient = crate::error::classify(e).is_some_and(ConduitError::is_transient);
                if transient {
                    let streak = self.transient_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if streak >= DEGRADE_AFTER && self.state() == SessionState::Ready {
                        tracing::warn!(server = %self.config.name, streak, "repeated transient failures");
                        self.set_state(SessionState::Degraded);
                    }
                }
            }
        }
        result
    }

    fn advertises(&self, flag: ServerCapabilityFlag) -> bool {
        self.server_info()
            .map(|info| capable(&info.capabilities, flag))
            .unwrap_or(false)
    }

    /// Tools offered by the server. Cached until invalidated.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        if let Some(tools) = self.cache.tools() {
            return Ok(tools);
        }
        self.ensure_usable()?;
        let _guard = self.list_lock.lock().await;
        if let Some(tools) = self.cache.tools() {
            return Ok(tools);
        }
        let generation = self.cache.generation(CapabilityKind::Tools);
        let tools = if self.advertises(ServerCapabilityFlag::Tools) {
            self.track(self.protocol.list_tools().await).await?
        } else {
            Vec::new()
        };
        self.cache.put_tools(generation, tools.clone());
        Ok(tools)
    }

    /// Resources offered by the server. Cached until invalidated.
    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        if let Some(resources) = self.cache.resources() {
            return Ok(resources);
        }
        self.ensure_usable()?;
        let _guard = self.list_lock.lock().await;
        if let Some(resources) = self.cache.resources() {
            return Ok(resources);
        }
        let generation = self.cache.generation(CapabilityKind::Resources);
        let resources = if self.advertises(ServerCapabilityFlag::Resources) {
            self.track(self.protocol.list_resources().await).await?
        } else {
            Vec::new()
        };
        self.cache.put_resources(generation, resources.clone());
        Ok(resources)
    }

    /// Prompts offered by the server. Cached until invalidated.
    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        if let Some(prompts) = self.cache.prompts() {
            return Ok(prompts);
        }
        self.ensure_usable()?;
        let _guard = self.list_lock.lock().await;
        if let Some(prompts) = self.cache.prompts() {
            return Ok(prompts);
        }
        let generation = self.cache.generation(CapabilityKind::Prompts);
        let prompts = if self.advertises(ServerCapabilityFlag::Prompts) {
            self.track(self.protocol.list_prompts().await).await?
        } else {
            Vec::new()
        };
        self.cache.put_prompts(generation, prompts.clone());
        Ok(prompts)
    }

    /// Drop every cached listing; the next list call goes to the server.
    pub fn refresh(&self) {
        self.cache.invalidate_all();
    }

    /// Invoke a tool. Arguments are passed through unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::ToolInvocation`] when the server answers with
    /// a JSON-RPC error or a result flagged `isError`, and
    /// [`ConduitError::Schema`] when a mid-call elicitation was malformed.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResponse> {
        self.invoke(name, arguments, None).await
    }

    /// Like [`Session::call_tool`], abandoned when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Cancelled`] on cancellation; the server is
    /// sent `notifications/cancelled`.
    pub async fn call_tool_cancellable(
        &self,
        name: &str,
        arguments: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<CallToolResponse> {
        self.invoke(name, arguments, Some(cancel)).await
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<CallToolResponse> {
        self.ensure_usable()?;
        tracing::debug!(server = %self.config.name, tool = name, "calling tool");
        let call_metrics = metrics::ToolCallMetrics::new(&self.config.name);
        let result = self
            .settle(name, self.protocol.call_tool(name, arguments, cancel).await)
            .await;
        call_metrics.record_result(&result);
        result
    }

    /// Map a raw `tools/call` outcome to the caller-facing result.
    async fn settle(&self, name: &str, outcome: Result<CallToolResponse>) -> Result<CallToolResponse> {
        let response = match self.track(outcome).await {
            Ok(response) => response,
            Err(e) => {
                return Err(match e.downcast::<ConduitError>() {
                    Ok(ConduitError::Rpc { code, message }) => ConduitError::ToolInvocation {
                        server: self.config.name.clone(),
                        tool: name.to_string(),
                        message,
                        code: Some(code),
                    }
                    .into(),
                    Ok(other) => other.into(),
                    Err(e) => e,
                })
            }
        };
        if response.is_error == Some(true) {
            return Err(ConduitError::ToolInvocation {
                server: self.config.name.clone(),
                tool: name.to_string(),
                message: response.text(),
                code: None,
            }
            .into());
        }
        Ok(response)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>> {
        self.ensure_usable()?;
        self.track(self.protocol.read_resource(uri).await).await
    }

    pub async fn render_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResponse> {
        self.ensure_usable()?;
        let arguments = (!arguments.is_empty()).then_some(arguments);
        self.track(self.protocol.get_prompt(name, arguments).await).await
    }

    /// Round-trip a `ping`.
    pub async fn ping(&self) -> Result<()> {
        self.ensure_usable()?;
        self.track(self.protocol.ping().await).await
    }

    /// Close the session. Idempotent.
    ///
    /// Pending requests fail with [`ConduitError::ConnectionLost`]. The
    /// session ends `Closed` even when releasing the transport fails; that
    /// failure is returned.
    pub async fn close(&self) -> Result<()> {
        self.shut_down(|| self.connection_lost()).await
    }

    /// Close after the server broke the protocol. Never reconnects.
    async fn abandon(&self, reason: &str) {
        tracing::error!(server = %self.config.name, reason, "protocol violation; closing session");
        let cause = || ConduitError::Protocol {
            server: self.config.name.clone(),
            message: reason.to_string(),
        };
        if let Err(e) = self.shut_down(cause).await {
            tracing::debug!(server = %self.config.name, error = %e, "transport close failed");
        }
    }

    /// Move to `Closed`, failing pending requests with `cause`.
    ///
    /// A second caller waits for the first to finish.
    async fn shut_down(&self, cause: impl Fn() -> ConduitError) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            let mut states = self.subscribe();
            let _ = states.wait_for(|s| *s == SessionState::Closed).await;
            return Ok(());
        }
        self.set_state(SessionState::Closing);
        self.shutdown.cancel();
        self.client.fail_all(|_| cause());

        let link = self.link.lock().await.take();
        let result = match link {
            Some(link) => {
                link.token.cancel();
                link.transport.close().await
            }
            None => Ok(()),
        };
        self.set_state(SessionState::Closed);
        if let Err(e) = &result {
            tracing::warn!(server = %self.config.name, error = %e, "transport close failed");
        }
        result
    }
}

impl Drop for Session {
    /// Stops the connection tasks of a session that was never closed.
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Wait on the read loop and reconnect or close when it ends.
async fn supervise(session: Weak<Session>, mut loop_handle: JoinHandle<LoopExit>) {
    loop {
        let exit = loop_handle.await.unwrap_or(LoopExit::Disconnected);
        let Some(session) = session.upgrade() else {
            return;
        };
        if session.shutdown.is_cancelled() {
            return;
        }

        if let LoopExit::Protocol(reason) = exit {
            session.abandon(&reason).await;
            return;
        }
        session.drop_link().await;

        tracing::warn!(server = %session.name(), "connection lost");
        session.reconnecting.store(true, Ordering::SeqCst);
        session.set_state(SessionState::Degraded);
        session.cache.invalidate_all();
        session.client.fail_all(|_| session.connection_lost());

        let outcome = session.reconnect().await;
        session.reconnecting.store(false, Ordering::SeqCst);
        metrics::record_reconnect(session.name(), outcome.is_ok());
        match outcome {
            Ok(handle) => loop_handle = handle,
            Err(e) => {
                if !session.shutdown.is_cancelled() {
                    tracing::error!(server = %session.name(), error = %e, "giving up on server");
                    session.shutdown.cancel();
                    session.set_state(SessionState::Closed);
                }
                return;
            }
        }
    }
}

/// Id of an outbound client request, if the message is one.
fn outbound_request_id(message: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(message).ok()?;
    value.get("method")?;
    value.get("id")?.as_u64()
}

/// Re-emit a server `notifications/message` through tracing.
fn log_server_message(server: &str, params: Value) {
    let Ok(msg) = serde_json::from_value::<LoggingMessageParams>(params) else {
        return;
    };
    let logger = msg.logger.as_deref().unwrap_or("");
    match msg.level {
        LoggingLevel::Debug => tracing::debug!(server, logger, data = %msg.data, "server log"),
        LoggingLevel::Info | LoggingLevel::Notice => {
            tracing::info!(server, logger, data = %msg.data, "server log")
        }
        LoggingLevel::Warning => tracing::warn!(server, logger, data = %msg.data, "server log"),
        _ => tracing::error!(server, logger, level = ?msg.level, data = %msg.data, "server log"),
    }
}
