//! Server registry and connection manager
//!
//! The registry maps configured server names to live [`Session`]s. Sessions
//! are created lazily on first use; concurrent callers asking for the same
//! server share one connection attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::error::{ConduitError, Result};
use crate::mcp::config::{McpConfig, ServerConfig, TransportKind};
use crate::mcp::session::{Session, SessionOptions, SessionState};

type SessionCell = Arc<OnceCell<Arc<Session>>>;

/// Outcome of closing several sessions.
#[derive(Debug, Default)]
pub struct CloseReport {
    /// Servers whose session closed cleanly.
    pub closed: Vec<String>,
    /// Servers whose close reported an error. The session is `Closed` anyway.
    pub failures: Vec<(String, anyhow::Error)>,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One row of [`ServerRegistry::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub name: String,
    pub transport: TransportKind,
    /// `Disconnected` when no session has been opened.
    pub state: SessionState,
}

/// Registry of configured MCP servers and their sessions
///
/// # Examples
///
/// ```no_run
/// use conduit::mcp::config::{McpConfig, ServerConfig};
/// use conduit::mcp::registry::ServerRegistry;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let config = McpConfig::default()
///     .with_server(ServerConfig::stdio("fetch", "uvx", &["mcp-server-fetch"]));
/// let registry = ServerRegistry::new(config);
///
/// let session = registry.get_session("fetch").await?;
/// println!("{} tools", session.list_tools().await?.len());
///
/// registry.close_all().await;
/// # Ok(())
/// # }
/// ```
pub struct ServerRegistry {
    config: McpConfig,
    options: SessionOptions,
    sessions: Mutex<HashMap<String, SessionCell>>,
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("servers", &self.server_names())
            .field("options", &self.options)
            .finish()
    }
}

impl ServerRegistry {
    /// Create a registry using session options derived from `config`
    ///
    /// # Arguments
    ///
    /// * `config` - Validated MCP configuration
    pub fn new(config: McpConfig) -> Self {
        let options = SessionOptions::from_config(&config);
        Self::with_options(config, options)
    }

    /// Create a registry with explicit session options
    ///
    /// # Arguments
    ///
    /// * `config` - Validated MCP configuration
    /// * `options` - Options applied to every session, such as the
    ///   elicitation handler
    pub fn with_options(config: McpConfig, options: SessionOptions) -> Self {
        Self {
            config,
            options,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionCell>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Configured server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        self.config.servers.keys().cloned().collect()
    }

    /// Configuration for one server.
    pub fn config(&self, name: &str) -> Option<&ServerConfig> {
        self.config.servers.get(name)
    }

    /// Get the live session for `name`, opening it if needed
    ///
    /// Concurrent callers share one connection attempt. A failed attempt is
    /// not cached, so the next caller tries again. A session that has reached
    /// `Closed` is replaced by a fresh one. A session that finishes opening
    /// after [`ServerRegistry::close_session`] or [`ServerRegistry::close_all`]
    /// released its slot is closed instead of returned.
    ///
    /// # Arguments
    ///
    /// * `name` - Configured server name
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Config`] for an unknown server,
    /// [`ConduitError::ConnectionLost`] when the registry closed the server
    /// while it was opening, otherwise whatever [`Session::start`] returns.
    pub async fn get_session(&self, name: &str) -> Result<Arc<Session>> {
        let config = self
            .config
            .servers
            .get(name)
            .ok_or_else(|| ConduitError::Config(format!("unknown MCP server '{name}'")))?;

        loop {
            let cell = Arc::clone(
                self.sessions()
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            );

            let session = Arc::clone(
                cell.get_or_try_init(|| {
                    tracing::debug!(server = name, "opening session");
                    Session::start(config.clone(), self.options.clone())
                })
                .await?,
            );

            if session.state() == SessionState::Closed {
                tracing::info!(server = name, "replacing closed session");
                let mut sessions = self.sessions();
                if sessions.get(name).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                    sessions.remove(name);
                }
                continue;
            }

            let detached = !self
                .sessions()
                .get(name)
                .is_some_and(|c| Arc::ptr_eq(c, &cell));
            if detached {
                tracing::info!(server = name, "server was closed while opening");
                if let Err(e) = session.close().await {
                    tracing::debug!(server = name, error = %e, "close failed");
                }
                return Err(ConduitError::ConnectionLost {
                    server: name.to_string(),
                }
                .into());
            }
            return Ok(session);
        }
    }

    /// Close one session. A server with no open session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Config`] for an unknown server, or the
    /// transport's close error.
    pub async fn close_session(&self, name: &str) -> Result<()> {
        if !self.config.servers.contains_key(name) {
            return Err(ConduitError::Config(format!("unknown MCP server '{name}'")).into());
        }
        let cell = self.sessions().remove(name);
        match cell.and_then(|c| c.get().cloned()) {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }

    /// Close every open session concurrently
    ///
    /// Every session is closed even when some fail; failures are collected
    /// in the report.
    pub async fn close_all(&self) -> CloseReport {
        let open: Vec<Arc<Session>> = self
            .sessions()
            .drain()
            .filter_map(|(_, cell)| cell.get().cloned())
            .collect();

        let results = futures::future::join_all(open.iter().map(|s| s.close())).await;

        let mut report = CloseReport::default();
        for (session, result) in open.iter().zip(results) {
            match result {
                Ok(()) => report.closed.push(session.name().to_string()),
                Err(e) => {
                    tracing::warn!(server = %session.name(), error = %e, "close failed");
                    report.failures.push((session.name().to_string(), e));
                }
            }
        }
        report.closed.sort();
        report
    }

    /// State of every configured server, in name order.
    pub fn status(&self) -> Vec<ServerStatus> {
        let sessions = self.sessions();
        self.config
            .servers
            .values()
            .map(|server| ServerStatus {
                name: server.name.clone(),
                transport: server.transport,
                state: sessions
                    .get(&server.name)
                    .and_then(|cell| cell.get())
                    .map(|s| s.state())
                    .unwrap_or(SessionState::Disconnected),
            })
            .collect()
    }
}
