//! Transport-agnostic async JSON-RPC 2.0 client
//!
//! [`JsonRpcClient`] owns the correlation table for one session. It writes
//! serialized messages to an outbound channel and is fed inbound messages by
//! [`start_read_loop`]; it never touches a transport directly.
//!
//! # Design
//!
//! - Request ids come from a counter that lives as long as the client, so
//!   ids stay unique across reconnects. The outbound channel is swapped with
//!   [`JsonRpcClient::set_outbound`] when a new transport is wired in.
//! - Every in-flight request has exactly one [`PendingRequest`]. It is
//!   inserted before the message is written and removed by whichever comes
//!   first: the matching response, a timeout, a cancellation, or a
//!   connection failure. A late response for a removed id is logged and
//!   dropped.
//! - Server-initiated requests are dispatched on their own task, so a
//!   handler that waits on a human (elicitation) never stalls the read loop.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{ConduitError, Result};
use crate::mcp::types::{
    CancelledParams, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    METHOD_INITIALIZE, METHOD_NOT_FOUND, NOTIF_CANCELLED,
};

/// Convenience alias for a boxed, `Send`-safe async future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Called with the raw `params` of a matching server notification.
type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync + 'static>;

/// Called with the raw `params` of a server request; resolves to the
/// `result` or `error` of the reply.
type ServerRequestHandler = Arc<
    dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, JsonRpcError>>
        + Send
        + Sync
        + 'static,
>;

/// An outstanding client request awaiting its response.
#[derive(Debug)]
struct PendingRequest {
    method: String,
    tx: oneshot::Sender<std::result::Result<Value, ConduitError>>,
}

/// Why a read loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The cancellation token fired.
    Cancelled,
    /// The inbound channel closed (transport gone).
    Disconnected,
    /// An inbound message was not valid JSON-RPC.
    Protocol(String),
}

/// Channel-backed JSON-RPC 2.0 client for one server.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
/// use conduit::mcp::client::{start_read_loop, JsonRpcClient};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let (out_tx, _out_rx) = mpsc::unbounded_channel::<String>();
/// let (_in_tx, in_rx) = mpsc::unbounded_channel::<String>();
/// let client = Arc::new(JsonRpcClient::new("local", out_tx));
/// let _loop = start_read_loop(in_rx, CancellationToken::new(), Arc::clone(&client));
/// let _pong: serde_json::Value = client
///     .request("ping", serde_json::json!({}), Duration::from_secs(5))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct JsonRpcClient {
    server: String,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    outbound_tx: RwLock<mpsc::UnboundedSender<String>>,
    notification_handlers: RwLock<HashMap<String, NotificationHandler>>,
    server_request_handlers: RwLock<HashMap<String, ServerRequestHandler>>,
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("server", &self.server)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JsonRpcClient {
    /// Create a client writing to `outbound_tx`. `server` labels errors and logs.
    pub fn new(server: impl Into<String>, outbound_tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            server: server.into(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound_tx: RwLock::new(outbound_tx),
            notification_handlers: RwLock::new(HashMap::new()),
            server_request_handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Server name this client talks to.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Point the client at a new outbound channel after a reconnect.
    ///
    /// The id counter is untouched.
    pub fn set_outbound(&self, outbound_tx: mpsc::UnboundedSender<String>) {
        *write(&self.outbound_tx) = outbound_tx;
    }

    fn send_raw(&self, message: String) -> Result<()> {
        read(&self.outbound_tx)
            .send(message)
            .map_err(|_| ConduitError::Transport("outbound channel closed".to_string()).into())
    }

    /// Send a request and deserialize its result.
    ///
    /// # Errors
    ///
    /// See [`JsonRpcClient::call`].
    pub async fn request<P, R>(&self, method: &str, params: P, timeout: Duration) -> Result<R>
    where
        P: serde::Serialize + Send,
        R: serde::de::DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let value = self.call(method, Some(params), timeout, None).await?;
        serde_json::from_value(value).map_err(|e| ConduitError::Serialization(e).into())
    }

    /// Send a request and await its raw result.
    ///
    /// The PendingRequest is registered before the message is written, so a
    /// fast response can never race past it.
    ///
    /// # Errors
    ///
    /// - [`ConduitError::Transport`] if the outbound channel is closed.
    /// - [`ConduitError::Timeout`] if no response arrives within `timeout`.
    ///   The server is sent `notifications/cancelled`.
    /// - [`ConduitError::Cancelled`] if `cancel` fires first. The server is
    ///   sent `notifications/cancelled`.
    /// - [`ConduitError::Rpc`] for a JSON-RPC error response.
    /// - [`ConduitError::ConnectionLost`] if the connection drops.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            id,
            PendingRequest {
                method: method.to_string(),
                tx,
            },
        );

        let sent = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(anyhow::Error::from)
            .and_then(|message| self.send_raw(message));
        if let Err(e) = sent {
            lock(&self.pending).remove(&id);
            return Err(e);
        }
        tracing::trace!(server = %self.server, id, method, "request sent");

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            outcome = rx => match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(ConduitError::ConnectionLost { server: self.server.clone() }.into()),
            },
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(server = %self.server, id, method, after = ?timeout, "request timed out");
                self.abandon(id, "request timed out");
                Err(ConduitError::Timeout {
                    server: self.server.clone(),
                    method: method.to_string(),
                    after: timeout,
                }
                .into())
            }
            _ = cancelled => {
                tracing::debug!(server = %self.server, id, method, "request cancelled by caller");
                self.abandon(id, "cancelled by client");
                Err(ConduitError::Cancelled { method: method.to_string() }.into())
            }
        }
    }

    /// Drop the PendingRequest for `id` and tell the server to stop work.
    ///
    /// The notification is best-effort; `initialize` is never cancelled.
    fn abandon(&self, id: u64, reason: &str) {
        let Some(pending) = lock(&self.pending).remove(&id) else {
            return;
        };
        if pending.method == METHOD_INITIALIZE {
            return;
        }
        let params = CancelledParams {
            request_id: Value::from(id),
            reason: Some(reason.to_string()),
        };
        if let Err(e) = self.notify(NOTIF_CANCELLED, params) {
            tracing::debug!(server = %self.server, id, error = %e, "could not send cancellation");
        }
    }

    /// Send a notification (no `id`, no reply).
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Transport`] if the outbound channel is closed.
    pub fn notify<P: serde::Serialize>(&self, method: &str, params: P) -> Result<()> {
        let params = match serde_json::to_value(params)? {
            Value::Null => None,
            v => Some(v),
        };
        let message = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.send_raw(message)
    }

    /// Reply to a server-initiated request.
    pub fn respond(&self, id: Value, outcome: std::result::Result<Value, JsonRpcError>) -> Result<()> {
        let response = match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::failure(id, error),
        };
        self.send_raw(serde_json::to_string(&response)?)
    }

    /// Register a handler for a server notification. Replaces any previous one.
    pub fn on_notification(
        &self,
        method: impl Into<String>,
        f: impl Fn(Value) + Send + Sync + 'static,
    ) {
        write(&self.notification_handlers).insert(method.into(), Arc::new(f));
    }

    /// Register a handler for a server-initiated request. Replaces any
    /// previous one.
    pub fn on_server_request(
        &self,
        method: impl Into<String>,
        f: impl Fn(Value) -> BoxFuture<'static, std::result::Result<Value, JsonRpcError>>
            + Send
            + Sync
            + 'static,
    ) {
        write(&self.server_request_handlers).insert(method.into(), Arc::new(f));
    }

    /// Whether a handler is registered for server request `method`.
    pub fn handles_request(&self, method: &str) -> bool {
        read(&self.server_request_handlers).contains_key(method)
    }

    /// Number of outstanding requests.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Ids of outstanding requests for `method`, ascending.
    pub fn in_flight(&self, method: &str) -> Vec<u64> {
        let mut ids: Vec<u64> = lock(&self.pending)
            .iter()
            .filter(|(_, p)| p.method == method)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Fail one outstanding request. Returns `false` if it was not pending.
    pub fn fail_request(&self, id: u64, error: ConduitError) -> bool {
        match lock(&self.pending).remove(&id) {
            Some(pending) => {
                let _ = pending.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request with an error built per request.
    pub fn fail_all(&self, make_error: impl Fn(&str) -> ConduitError) {
        let drained: Vec<PendingRequest> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.tx.send(Err(make_error(&pending.method)));
        }
    }

    fn resolve(&self, id: u64, outcome: std::result::Result<Value, ConduitError>) {
        match lock(&self.pending).remove(&id) {
            Some(pending) => {
                let _ = pending.tx.send(outcome);
            }
            None => {
                tracing::debug!(server = %self.server, id, "response for unknown or abandoned id; ignoring");
            }
        }
    }
}

/// Start the read loop as a background task.
///
/// Each inbound message is classified and dispatched:
///
/// - **Response**: resolves the matching PendingRequest.
/// - **Server request**: runs the registered handler on its own task and
///   writes the reply; `-32601` when no handler exists.
/// - **Notification**: calls the registered handler, if any.
///
/// Malformed JSON ends the loop with [`LoopExit::Protocol`]. Pending
/// requests are left for the caller to fail with the appropriate error.
pub fn start_read_loop(
    mut inbound_rx: mpsc::UnboundedReceiver<String>,
    cancellation: CancellationToken,
    client: Arc<JsonRpcClient>,
) -> tokio::task::JoinHandle<LoopExit> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = cancellation.cancelled() => return LoopExit::Cancelled,

                maybe_msg = inbound_rx.recv() => {
                    let Some(raw) = maybe_msg else {
                        return LoopExit::Disconnected;
                    };
                    if let Err(reason) = dispatch_message(&raw, &client) {
                        tracing::error!(server = %client.server, error = %reason, "malformed inbound message");
                        return LoopExit::Protocol(reason);
                    }
                }
            }
        }
    })
}

/// Classify and dispatch one inbound message.
fn dispatch_message(raw: &str, client: &Arc<JsonRpcClient>) -> std::result::Result<(), String> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| format!("invalid JSON from server: {e}"))?;

    if let Value::Array(batch) = value {
        for item in batch {
            dispatch_value(item, client)?;
        }
        return Ok(());
    }
    dispatch_value(value, client)
}

fn dispatch_value(value: Value, client: &Arc<JsonRpcClient>) -> std::result::Result<(), String> {
    if !value.is_object() {
        return Err(format!("expected a JSON-RPC object, got {value}"));
    }
    let has_id = value.get("id").is_some_and(|id| !id.is_null());
    let has_method = value.get("method").is_some_and(Value::is_string);
    let has_outcome = value.get("result").is_some() || value.get("error").is_some();

    match (has_id, has_method, has_outcome) {
        (true, false, true) => handle_response(value, client),
        (true, true, _) => handle_server_request(value, client),
        (false, true, _) => handle_notification(value, client),
        (false, false, true) => {
            // Error responses to unparseable requests carry `id: null`.
            tracing::warn!(server = %client.server, message = %value, "response without id; ignoring");
        }
        _ => return Err(format!("unclassifiable JSON-RPC message: {value}")),
    }
    Ok(())
}

fn handle_response(value: Value, client: &Arc<JsonRpcClient>) {
    let id_val = &value["id"];
    let id = match id_val
        .as_u64()
        .or_else(|| id_val.as_str().and_then(|s| s.parse().ok()))
    {
        Some(id) => id,
        None => {
            tracing::warn!(server = %client.server, id = %id_val, "response has non-integer id");
            return;
        }
    };

    let outcome = match value.get("error") {
        Some(error_val) => {
            let err = serde_json::from_value::<JsonRpcError>(error_val.clone()).unwrap_or_else(|_| {
                JsonRpcError::new(
                    crate::mcp::types::INTERNAL_ERROR,
                    format!("malformed error object: {error_val}"),
                )
            });
            Err(ConduitError::Rpc {
                code: err.code,
                message: err.message,
            })
        }
        None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
    };
    client.resolve(id, outcome);
}

fn handle_server_request(value: Value, client: &Arc<JsonRpcClient>) {
    let method = value["method"].as_str().unwrap_or_default().to_string();
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let params = value.get("params").cloned().unwrap_or(Value::Null);

    let handler = read(&client.server_request_handlers).get(&method).cloned();
    let client = Arc::clone(client);
    match handler {
        Some(handler) => {
            tokio::spawn(async move {
                let outcome = handler(params).await;
                if let Err(e) = client.respond(id, outcome) {
                    tracing::debug!(server = %client.server, method = %method, error = %e, "could not reply to server request");
                }
            });
        }
        None => {
            tracing::debug!(server = %client.server, method = %method, "no handler for server request");
            let error = JsonRpcError::new(METHOD_NOT_FOUND, format!("Method not found: {method}"));
            let _ = client.respond(id, Err(error));
        }
    }
}

fn handle_notification(value: Value, client: &Arc<JsonRpcClient>) {
    let method = value["method"].as_str().unwrap_or_default();
    let params = value.get("params").cloned().unwrap_or(Value::Null);

    let handler = read(&client.notification_handlers).get(method).cloned();
    match handler {
        Some(handler) => handler(params),
        None => {
            tracing::debug!(server = %client.server, method, "no handler for notification; ignoring")
        }
    }
}
