//! Capability façade over several servers
//!
//! [`McpAggregator`] binds a set of registry servers and presents their tools,
//! resources, and prompts as one catalog. Tool and prompt names are
//! qualified as `server__name` so that identical names on different servers
//! stay distinct. Listing fails open: a server that cannot answer is logged
//! and skipped, and the rest of the catalog is still returned.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use serde_json::Value;

use crate::error::{ConduitError, Result};
use crate::mcp::config::QUALIFIED_NAME_SEPARATOR;
use crate::mcp::registry::{CloseReport, ServerRegistry};
use crate::mcp::session::Session;
use crate::mcp::types::{
    CallToolResponse, GetPromptResponse, McpTool, Prompt, Resource, ResourceContents,
};

/// Build `server__name`.
///
/// # Examples
///
/// ```
/// use conduit::mcp::aggregator::qualify;
///
/// assert_eq!(qualify("filesystem", "read_file"), "filesystem__read_file");
/// ```
pub fn qualify(server: &str, name: &str) -> String {
    format!("{server}{QUALIFIED_NAME_SEPARATOR}{name}")
}

/// A tool tagged with the server that offers it.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespacedTool {
    pub server: String,
    pub tool: McpTool,
    pub qualified_name: String,
}

/// A resource tagged with the server that offers it.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespacedResource {
    pub server: String,
    pub resource: Resource,
}

/// A prompt tagged with the server that offers it.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespacedPrompt {
    pub server: String,
    pub prompt: Prompt,
    pub qualified_name: String,
}

/// Result of [`McpAggregator::attach`].
#[derive(Debug, Default)]
pub struct AttachReport {
    pub connected: Vec<String>,
    pub failures: Vec<(String, anyhow::Error)>,
}

/// Bare name to the bound servers offering it, from the last listing.
type NameIndex = HashMap<String, Vec<String>>;

/// One catalog over several MCP servers
pub struct McpAggregator {
    registry: Arc<ServerRegistry>,
    servers: Vec<String>,
    tool_index: RwLock<NameIndex>,
    prompt_index: RwLock<NameIndex>,
}

impl std::fmt::Debug for McpAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpAggregator")
            .field("servers", &self.servers)
            .finish_non_exhaustive()
    }
}

impl McpAggregator {
    /// Bind `servers` from `registry`
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Config`] if a name is not configured in the
    /// registry.
    pub fn new(registry: Arc<ServerRegistry>, servers: Vec<String>) -> Result<Self> {
        for name in &servers {
            if registry.config(name).is_none() {
                return Err(ConduitError::Config(format!("unknown MCP server '{name}'")).into());
            }
        }
        let mut servers = servers;
        servers.sort();
        servers.dedup();
        Ok(Self {
            registry,
            servers,
            tool_index: RwLock::new(HashMap::new()),
            prompt_index: RwLock::new(HashMap::new()),
        })
    }

    /// Bind every server the registry knows.
    pub fn all(registry: Arc<ServerRegistry>) -> Self {
        let servers = registry.server_names();
        Self {
            registry,
            servers,
            tool_index: RwLock::new(HashMap::new()),
            prompt_index: RwLock::new(HashMap::new()),
        }
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Open every bound session concurrently and report which failed.
    pub async fn attach(&self) -> AttachReport {
        let results = join_all(self.servers.iter().map(|name| self.registry.get_session(name))).await;
        let mut report = AttachReport::default();
        for (name, result) in self.servers.iter().zip(results) {
            match result {
                Ok(_) => report.connected.push(name.clone()),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "server unavailable");
                    report.failures.push((name.clone(), e));
                }
            }
        }
        report
    }

    /// Close every bound session.
    pub async fn detach(&self) -> CloseReport {
        let results = join_all(self.servers.iter().map(|name| self.registry.close_session(name))).await;
        let mut report = CloseReport::default();
        for (name, result) in self.servers.iter().zip(results) {
            match result {
                Ok(()) => report.closed.push(name.clone()),
                Err(e) => report.failures.push((name.clone(), e)),
            }
        }
        report
    }

    /// Run `op` against every bound server, skipping and logging failures.
    async fn gather<'a, T, F, Fut>(&'a self, what: &'static str, op: F) -> Vec<(String, Vec<T>)>
    where
        F: Fn(Arc<Session>) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<T>>> + 'a,
    {
        let fetches = self.servers.iter().map(|name| {
            let op = &op;
            async move {
                let session = self.registry.get_session(name).await?;
                op(session).await
            }
        });
        let results = join_all(fetches).await;

        let mut gathered = Vec::new();
        for (name, result) in self.servers.iter().zip(results) {
            match result {
                Ok(items) => gathered.push((name.clone(), items)),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "skipping server while listing {what}");
                }
            }
        }
        gathered
    }

    /// Tools from every reachable bound server
    ///
    /// Rebuilds the bare-name index used by [`McpAggregator::call_tool`].
    pub async fn list_tools(&self) -> Vec<NamespacedTool> {
        let gathered = self
            .gather("tools", |session| async move { session.list_tools().await })
            .await;

        let mut index = NameIndex::new();
        let mut tools = Vec::new();
        for (server, list) in gathered {
            for tool in list {
                index.entry(tool.name.clone()).or_default().push(server.clone());
                tools.push(NamespacedTool {
                    qualified_name: qualify(&server, &tool.name),
                    server: server.clone(),
                    tool,
                });
            }
        }
        *self.tool_index.write().unwrap_or_else(|p| p.into_inner()) = index;
        tools
    }

    /// Resources from every reachable bound server.
    pub async fn list_resources(&self) -> Vec<NamespacedResource> {
        self.gather("resources", |session| async move { session.list_resources().await })
            .await
            .into_iter()
            .flat_map(|(server, list)| {
                list.into_iter().map(move |resource| NamespacedResource {
                    server: server.clone(),
                    resource,
                })
            })
            .collect()
    }

    /// Prompts from every reachable bound server.
    pub async fn list_prompts(&self) -> Vec<NamespacedPrompt> {
        let gathered = self
            .gather("prompts", |session| async move { session.list_prompts().await })
            .await;

        let mut index = NameIndex::new();
        let mut prompts = Vec::new();
        for (server, list) in gathered {
            for prompt in list {
                index.entry(prompt.name.clone()).or_default().push(server.clone());
                prompts.push(NamespacedPrompt {
                    qualified_name: qualify(&server, &prompt.name),
                    server: server.clone(),
                    prompt,
                });
            }
        }
        *self.prompt_index.write().unwrap_or_else(|p| p.into_inner()) = index;
        prompts
    }

    /// Split a qualified name into `(server, name)`.
    ///
    /// The longest bound server name followed by `__` wins; otherwise a bare
    /// name offered by exactly one server in `index` resolves to it.
    fn resolve(&self, qualified: &str, index: &RwLock<NameIndex>) -> Result<(String, String)> {
        let prefixed = self
            .servers
            .iter()
            .filter_map(|server| {
                qualified
                    .strip_prefix(server.as_str())
                    .and_then(|rest| rest.strip_prefix(QUALIFIED_NAME_SEPARATOR))
                    .filter(|name| !name.is_empty())
                    .map(|name| (server, name))
            })
            .max_by_key(|(server, _)| server.len());
        if let Some((server, name)) = prefixed {
            return Ok((server.clone(), name.to_string()));
        }

        let index = index.read().unwrap_or_else(|p| p.into_inner());
        match index.get(qualified).map(Vec::as_slice) {
            Some([server]) => Ok((server.clone(), qualified.to_string())),
            Some(servers) if servers.len() > 1 => Err(ConduitError::UnknownTool(format!(
                "'{qualified}' is offered by several servers ({}); qualify it",
                servers.join(", ")
            ))
            .into()),
            _ => Err(ConduitError::UnknownTool(qualified.to_string()).into()),
        }
    }

    /// Call a tool by qualified or unambiguous bare name
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::UnknownTool`] when the name resolves to no
    /// bound server, or to more than one.
    pub async fn call_tool(&self, qualified_name: &str, arguments: Option<Value>) -> Result<CallToolResponse> {
        let (server, tool) = self.resolve(qualified_name, &self.tool_index)?;
        tracing::debug!(server = %server, tool = %tool, "routing tool call");
        self.registry
            .get_session(&server)
            .await?
            .call_tool(&tool, arguments)
            .await
    }

    /// Read a resource from a bound server.
    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<Vec<ResourceContents>> {
        if !self.servers.iter().any(|s| s == server) {
            return Err(ConduitError::Config(format!("server '{server}' is not bound")).into());
        }
        self.registry.get_session(server).await?.read_resource(uri).await
    }

    /// Render a prompt by qualified or unambiguous bare name.
    pub async fn render_prompt(
        &self,
        qualified_name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResponse> {
        let (server, prompt) = self.resolve(qualified_name, &self.prompt_index)?;
        self.registry
            .get_session(&server)
            .await?
            .render_prompt(&prompt, arguments)
            .await
    }
}
