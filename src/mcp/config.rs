//! MCP server registry configuration
//!
//! [`McpConfig`] is the validated mapping from server name to
//! [`ServerConfig`] that the [`crate::mcp::registry::ServerRegistry`]
//! consumes. Values arrive here already environment-substituted (see
//! [`crate::config::Config::load`]); nothing in this module reads the
//! environment.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConduitError, Result};
use crate::mcp::types::Root;

/// Separator between server and tool in a qualified tool name.
pub const QUALIFIED_NAME_SEPARATOR: &str = "__";

/// Wire protocol used to reach a server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Child process speaking newline-delimited JSON on stdin/stdout.
    Stdio,
    /// Legacy HTTP+SSE: a GET event stream plus POSTs to an announced endpoint.
    Sse,
    /// Persistent WebSocket, one message per frame.
    Websocket,
    /// Streamable HTTP: one POST per message, JSON or SSE response bodies.
    StreamableHttp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::Websocket => "websocket",
            TransportKind::StreamableHttp => "streamable_http",
        };
        f.write_str(s)
    }
}

/// Authentication scheme for network transports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    None,
    /// `Authorization: Bearer <credential>`
    Bearer,
    /// `<header>: <credential>`, header defaulting to `X-API-Key`
    ApiKey,
}

/// Auth descriptor attached to a network server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AuthConfig {
    #[serde(rename = "type", default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub credential: Option<String>,
    /// Header name for `api_key`.
    #[serde(default)]
    pub header: Option<String>,
}

impl AuthConfig {
    /// Header the credential is sent in, or `None` for `type: none`.
    ///
    /// # Examples
    ///
    /// ```
    /// use conduit::mcp::config::{AuthConfig, AuthType};
    ///
    /// let auth = AuthConfig {
    ///     auth_type: AuthType::Bearer,
    ///     credential: Some("abc".into()),
    ///     header: None,
    /// };
    /// assert_eq!(
    ///     auth.header_pair(),
    ///     Some(("Authorization".to_string(), "Bearer abc".to_string()))
    /// );
    /// ```
    pub fn header_pair(&self) -> Option<(String, String)> {
        let credential = self.credential.as_deref()?;
        match self.auth_type {
            AuthType::None => None,
            AuthType::Bearer => Some(("Authorization".to_string(), format!("Bearer {credential}"))),
            AuthType::ApiKey => Some((
                self.header.clone().unwrap_or_else(|| "X-API-Key".to_string()),
                credential.to_string(),
            )),
        }
    }
}

/// A filesystem root advertised to a server through `roots/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RootConfig {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl From<&RootConfig> for Root {
    fn from(r: &RootConfig) -> Self {
        Root {
            uri: r.uri.clone(),
            name: r.name.clone(),
        }
    }
}

fn default_terminate_on_close() -> bool {
    true
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_read_timeout_seconds() -> u64 {
    60
}

/// Connection parameters for one MCP server.
///
/// Immutable once loaded; shared behind `Arc` by the registry and every
/// session created for this server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Filled from the map key by [`McpConfig::normalize`].
    #[serde(default)]
    pub name: String,
    pub transport: TransportKind,

    // stdio
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    // network
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Bound on connect plus response headers.
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    /// Per-request deadline and per-chunk idle bound.
    #[serde(default = "default_read_timeout_seconds")]
    pub read_timeout_seconds: u64,

    #[serde(default = "default_terminate_on_close")]
    pub terminate_on_close: bool,
    #[serde(default)]
    pub roots: Vec<RootConfig>,
}

impl ServerConfig {
    /// A stdio server with default timeouts.
    ///
    /// # Examples
    ///
    /// ```
    /// use conduit::mcp::config::{ServerConfig, TransportKind};
    ///
    /// let cfg = ServerConfig::stdio("fetch", "uvx", &["mcp-server-fetch"]);
    /// assert_eq!(cfg.transport, TransportKind::Stdio);
    /// assert!(cfg.terminate_on_close);
    /// ```
    pub fn stdio(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            transport: TransportKind::Stdio,
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            auth: None,
            http_timeout_seconds: default_http_timeout_seconds(),
            read_timeout_seconds: default_read_timeout_seconds(),
            terminate_on_close: default_terminate_on_close(),
            roots: Vec::new(),
        }
    }

    /// A network server of the given kind with default timeouts.
    pub fn network(name: &str, transport: TransportKind, url: &str) -> Self {
        Self {
            transport,
            command: None,
            url: Some(url.to_string()),
            ..Self::stdio(name, "", &[])
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    /// Configured headers merged with the auth header, auth winning.
    pub fn effective_headers(&self) -> HashMap<String, String> {
        let mut headers = self.headers.clone();
        if let Some((k, v)) = self.auth.as_ref().and_then(AuthConfig::header_pair) {
            headers.insert(k, v);
        }
        headers
    }

    /// Parsed server URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Config`] when the URL is missing or invalid.
    pub fn parsed_url(&self) -> Result<url::Url> {
        let raw = self.url.as_deref().ok_or_else(|| {
            ConduitError::Config(format!("server '{}': url is required", self.name))
        })?;
        url::Url::parse(raw).map_err(|e| {
            ConduitError::Config(format!("server '{}': invalid url '{raw}': {e}", self.name)).into()
        })
    }

    /// Validate one entry.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Config`] naming the server and the offending field.
    pub fn validate(&self) -> Result<()> {
        let name = &self.name;
        if name.is_empty() {
            return Err(ConduitError::Config("server name cannot be empty".to_string()).into());
        }
        if name.contains(QUALIFIED_NAME_SEPARATOR) {
            return Err(ConduitError::Config(format!(
                "server '{name}': name must not contain '{QUALIFIED_NAME_SEPARATOR}'"
            ))
            .into());
        }
        if self.http_timeout_seconds == 0 || self.read_timeout_seconds == 0 {
            return Err(ConduitError::Config(format!(
                "server '{name}': timeouts must be greater than 0"
            ))
            .into());
        }

        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(ConduitError::Config(format!(
                        "server '{name}': stdio transport requires a command"
                    ))
                    .into());
                }
            }
            kind => {
                let url = self.parsed_url()?;
                let allowed: &[&str] = if kind == TransportKind::Websocket {
                    &["ws", "wss"]
                } else {
                    &["http", "https"]
                };
                if !allowed.contains(&url.scheme()) {
                    return Err(ConduitError::Config(format!(
                        "server '{name}': {kind} transport requires a {} url, got '{}'",
                        allowed.join("/"),
                        url.scheme()
                    ))
                    .into());
                }
            }
        }

        if let Some(auth) = &self.auth {
            if auth.auth_type != AuthType::None
                && auth.credential.as_deref().map_or(true, str::is_empty)
            {
                return Err(ConduitError::Config(format!(
                    "server '{name}': auth type requires a credential"
                ))
                .into());
            }
        }

        Ok(())
    }
}

/// Reconnect policy applied to every session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based): `initial * 2^attempt`,
    /// capped at `max_backoff_ms`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use conduit::mcp::config::ReconnectPolicy;
    ///
    /// let p = ReconnectPolicy::default();
    /// assert_eq!(p.backoff(0), Duration::from_millis(500));
    /// assert_eq!(p.backoff(2), Duration::from_millis(2000));
    /// assert_eq!(p.backoff(20), Duration::from_millis(10_000));
    /// ```
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

fn default_client_name() -> String {
    "conduit".to_string()
}

/// MCP client configuration
///
/// Defaults to an empty server map so that configuration files without an
/// `mcp:` key still deserialize.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpConfig {
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
            reconnect: ReconnectPolicy::default(),
            servers: BTreeMap::new(),
        }
    }
}

impl McpConfig {
    /// Copy each map key into its entry's `name`.
    pub fn normalize(&mut self) {
        for (name, server) in self.servers.iter_mut() {
            server.name = name.clone();
        }
    }

    /// Validate every server entry.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConduitError::Config`] encountered.
    pub fn validate(&self) -> Result<()> {
        if self.client_name.trim().is_empty() {
            return Err(ConduitError::Config("mcp.client_name cannot be empty".to_string()).into());
        }
        for (key, server) in &self.servers {
            if &server.name != key {
                return Err(ConduitError::Config(format!(
                    "server entry '{key}' carries mismatched name '{}'",
                    server.name
                ))
                .into());
            }
            server.validate()?;
        }
        Ok(())
    }

    /// Insert a server, keying it by its own name.
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.servers.insert(server.name.clone(), server);
        self
    }
}
