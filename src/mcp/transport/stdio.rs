//! Stdio transport for MCP child-process servers
//!
//! [`StdioTransport`] spawns a child process and talks to it over its
//! stdin/stdout pipes using newline-delimited JSON.
//!
//! # Protocol
//!
//! - Outbound messages are written to the child's stdin followed by `\n`.
//! - Inbound messages are read from stdout one line at a time; blank lines
//!   are skipped. Lines are reassembled by the buffered reader, so a message
//!   split across several pipe reads is delivered whole.
//! - stderr is logged at debug level and exposed through
//!   [`Transport::receive_err`]. It is never treated as an error.
//!
//! # Lifecycle
//!
//! [`Transport::close`] honours `terminate_on_close`: when set, the child
//! receives SIGTERM (Unix), gets [`TERMINATION_GRACE`] to exit, and is then
//! killed. When unset, only stdin is closed and the child is left running.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{ConduitError, Result};
use crate::mcp::config::ServerConfig;
use crate::mcp::transport::{
    channel_closed, connect_error, shared_receiver_stream, MessageStream, Transport,
};

/// How long a terminated child may take to exit before it is killed.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(2);

/// Parent variables passed through to every child. Launchers such as `npx`
/// and `uvx` fail without `PATH` and `HOME`.
const INHERITED_ENV_VARS: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

/// Options for spawning a stdio server.
#[derive(Debug, Clone)]
pub struct StdioOptions {
    pub server: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub terminate_on_close: bool,
}

/// Stdio-based MCP transport that drives a child process.
///
/// # Examples
///
/// ```no_run
/// use conduit::mcp::config::ServerConfig;
/// use conduit::mcp::transport::stdio::StdioTransport;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let cfg = ServerConfig::stdio(
///     "filesystem",
///     "npx",
///     &["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
/// );
/// let transport = StdioTransport::from_config(&cfg)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct StdioTransport {
    server: String,
    stdin_tx: mpsc::UnboundedSender<String>,
    stdout_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    stderr_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    child: Arc<Mutex<Child>>,
    terminate_on_close: bool,
    /// Stops the pipe tasks; cancelled by `close`.
    shutdown: CancellationToken,
}

impl StdioTransport {
    /// Spawn the server described by a stdio [`ServerConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Config`] when `command` is missing and
    /// [`ConduitError::Connection`] when the process cannot be spawned.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let command = config.command.clone().ok_or_else(|| {
            ConduitError::Config(format!("server '{}': stdio requires a command", config.name))
        })?;
        Self::spawn(StdioOptions {
            server: config.name.clone(),
            command: PathBuf::from(command),
            args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
            terminate_on_close: config.terminate_on_close,
        })
    }

    /// Spawn a child process and wire up stdio pipes.
    ///
    /// The child's environment is cleared, then seeded with the inherited
    /// allow-list, then overlaid with `options.env`.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Connection`] if the process cannot be spawned
    /// or its pipes are unavailable.
    pub fn spawn(options: StdioOptions) -> Result<Self> {
        let StdioOptions {
            server,
            command,
            args,
            env,
            cwd,
            terminate_on_close,
        } = options;

        tracing::info!(
            server = %server,
            command = %command.display(),
            args = ?args,
            "spawning MCP server process"
        );

        let mut cmd = Command::new(&command);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(terminate_on_close)
            .env_clear()
            .envs(inherited_env())
            .envs(&env);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            connect_error(
                &server,
                format!("failed to spawn `{}`: {}", command.display(), e),
            )
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| connect_error(&server, "child stdin unavailable after spawn"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| connect_error(&server, "child stdout unavailable after spawn"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| connect_error(&server, "child stderr unavailable after spawn"))?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel::<String>();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel::<String>();
        let shutdown = CancellationToken::new();

        // stdin writer; dropping `stdin` on exit closes the pipe.
        let token = shutdown.clone();
        let name = server.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            loop {
                let msg = tokio::select! {
                    _ = token.cancelled() => break,
                    msg = stdin_rx.recv() => match msg {
                        Some(m) => m,
                        None => break,
                    },
                };
                let line = format!("{msg}\n");
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    tracing::debug!(server = %name, error = %e, "stdin write failed");
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        let token = shutdown.clone();
        let name = server.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    next = lines.next_line() => next,
                };
                match next {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        if stdout_tx.send(trimmed.to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(server = %name, "MCP server stdout closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(server = %name, error = %e, "error reading MCP server stdout");
                        break;
                    }
                }
            }
        });

        let name = server.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %name, "mcp server stderr: {}", line);
                if stderr_tx.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            server,
            stdin_tx,
            stdout_rx: Arc::new(Mutex::new(stdout_rx)),
            stderr_rx: Arc::new(Mutex::new(stderr_rx)),
            child: Arc::new(Mutex::new(child)),
            terminate_on_close,
            shutdown,
        })
    }

    /// OS process id of the child, if it is still running.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.id()
    }

    async fn terminate(&self, child: &mut Child) -> Result<()> {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: pid comes from a child we spawned and have not reaped.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(TERMINATION_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server, %status, "MCP server exited");
                Ok(())
            }
            Ok(Err(e)) => Err(ConduitError::Io(e).into()),
            Err(_) => {
                tracing::warn!(
                    server = %self.server,
                    grace = ?TERMINATION_GRACE,
                    "MCP server ignored SIGTERM; killing"
                );
                child.kill().await.map_err(|e| ConduitError::Io(e).into())
            }
        }
    }
}

fn inherited_env() -> Vec<(String, String)> {
    INHERITED_ENV_VARS
        .iter()
        .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
        .collect()
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: String) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(channel_closed("stdin"));
        }
        self.stdin_tx
            .send(message)
            .map_err(|_| channel_closed("stdin"))
    }

    fn receive(&self) -> MessageStream<'_> {
        shared_receiver_stream(Arc::clone(&self.stdout_rx))
    }

    fn receive_err(&self) -> MessageStream<'_> {
        shared_receiver_stream(Arc::clone(&self.stderr_rx))
    }

    async fn close(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();

        let mut child = self.child.lock().await;
        if !self.terminate_on_close {
            tracing::debug!(server = %self.server, "closing stdin; leaving MCP server running");
            return Ok(());
        }
        if matches!(child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }
        self.terminate(&mut child).await
    }
}
