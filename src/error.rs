//! Error types for Conduit
//!
//! This module defines all error types used throughout the crate, using
//! `thiserror` for the taxonomy and `anyhow` for propagation. Callers that
//! need to branch on a failure class downcast with
//! `err.downcast_ref::<ConduitError>()`.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Conduit operations
///
/// Every failure surfaced by a transport, session, registry, or the
/// capability façade maps onto one of these variants. Failures are scoped
/// to a single server: a variant carrying a `server` name never implies
/// that another server's session was affected.
#[derive(Error, Debug)]
pub enum ConduitError {
    /// Invalid or missing configuration. Raised before any connection attempt.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level connect failure
    #[error("Connection error for server '{server}': {message}")]
    Connection {
        /// Server whose connection failed
        server: String,
        /// Underlying failure description
        message: String,
    },

    /// A request or read did not complete within its deadline
    #[error("Timeout after {after:?} waiting for '{method}' on server '{server}'")]
    Timeout {
        /// Server the request was sent to
        server: String,
        /// JSON-RPC method that timed out
        method: String,
        /// Deadline that elapsed
        after: Duration,
    },

    /// Malformed or unexpected message from a server
    #[error("Protocol error from server '{server}': {message}")]
    Protocol {
        /// Server that sent the offending message
        server: String,
        /// Description of the violation
        message: String,
    },

    /// Server selected a protocol revision this client does not speak
    #[error("Unsupported protocol version: expected one of {expected:?}, got '{got}'")]
    ProtocolVersion {
        /// Versions this client accepts
        expected: Vec<String>,
        /// Version the server returned
        got: String,
    },

    /// Server-reported failure executing a tool. Surfaced verbatim.
    #[error("Tool '{tool}' on server '{server}' failed: {message}")]
    ToolInvocation {
        /// Server that executed the tool
        server: String,
        /// Tool name as known to the server
        tool: String,
        /// Message reported by the server
        message: String,
        /// JSON-RPC error code, when the failure was an error response
        code: Option<i64>,
    },

    /// Elicitation schema or elicited content violates the primitive-only rule
    #[error("Schema error: {0}")]
    Schema(String),

    /// The session died while the request was outstanding
    #[error("Connection lost to server '{server}'")]
    ConnectionLost {
        /// Server whose session was lost
        server: String,
    },

    /// Failure writing to or reading from an established transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON-RPC error object returned for a non-tool request
    #[error("JSON-RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// JSON-RPC error message
        message: String,
    },

    /// The caller cancelled an in-flight request
    #[error("Request '{method}' was cancelled")]
    Cancelled {
        /// Method of the cancelled request
        method: String,
    },

    /// Authentication rejected by a network transport (HTTP 401)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Session is not in a state that accepts requests
    #[error("Server '{server}' is not ready (state: {state})")]
    NotReady {
        /// Server name
        server: String,
        /// Current session state
        state: String,
    },

    /// A qualified tool or prompt name could not be routed to a server
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ConduitError {
    /// Whether the failure is a transient condition of a still-live session.
    ///
    /// Transient failures count towards the `Degraded` threshold of a
    /// session; everything else is either terminal for the session or a
    /// per-call outcome that says nothing about connection health.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConduitError::Timeout { .. } | ConduitError::Transport(_) | ConduitError::Http(_)
        )
    }
}

/// Result type alias for Conduit operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

/// Returns the [`ConduitError`] at the root of an `anyhow` error, if any.
pub fn classify(err: &anyhow::Error) -> Option<&ConduitError> {
    err.downcast_ref::<ConduitError>()
}
