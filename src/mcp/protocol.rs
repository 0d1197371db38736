//! Typed MCP methods over [`JsonRpcClient`]
//!
//! [`McpProtocol`] knows the MCP method names, parameter shapes, and
//! pagination; it knows nothing about session state, caching, or
//! reconnection, which live in [`crate::mcp::session`].
//!
//! All listing methods follow `nextCursor` until the server stops returning
//! one. A server that hands back a cursor it already returned is treated as
//! a protocol error rather than looped on forever. So is a result that does
//! not have the shape its method requires.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{ConduitError, Result};
use crate::mcp::client::JsonRpcClient;
use crate::mcp::types::{
    CallToolParams, CallToolResponse, ClientCapabilities, GetPromptParams, GetPromptResponse,
    Implementation, InitializeParams, InitializeResponse, ListPromptsResponse,
    ListResourcesResponse, ListToolsResponse, McpTool, PaginatedParams, Prompt,
    ReadResourceParams, ReadResourceResponse, Resource, ResourceContents, ServerCapabilities,
    LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_PING, METHOD_PROMPTS_GET,
    METHOD_PROMPTS_LIST, METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ, METHOD_TOOLS_CALL,
    METHOD_TOOLS_LIST, NOTIF_INITIALIZED, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Identifies a capability a server may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCapabilityFlag {
    Tools,
    Resources,
    Prompts,
    Logging,
}

/// Whether `caps` advertises `flag`.
pub fn capable(caps: &ServerCapabilities, flag: ServerCapabilityFlag) -> bool {
    match flag {
        ServerCapabilityFlag::Tools => caps.tools.is_some(),
        ServerCapabilityFlag::Resources => caps.resources.is_some(),
        ServerCapabilityFlag::Prompts => caps.prompts.is_some(),
        ServerCapabilityFlag::Logging => caps.logging.is_some(),
    }
}

/// Typed MCP requests for one server, each bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct McpProtocol {
    client: Arc<JsonRpcClient>,
    timeout: Duration,
}

impl McpProtocol {
    pub fn new(client: Arc<JsonRpcClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn client(&self) -> &Arc<JsonRpcClient> {
        &self.client
    }

    fn protocol_error(&self, message: impl Into<String>) -> anyhow::Error {
        ConduitError::Protocol {
            server: self.client.server().to_string(),
            message: message.into(),
        }
        .into()
    }

    /// Send a request and decode its result.
    ///
    /// A result of the wrong shape is a [`ConduitError::Protocol`].
    async fn fetch<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let value = self
            .client
            .call(method, Some(params), self.timeout, None)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| self.protocol_error(format!("malformed {method} result: {e}")))
    }

    /// Perform the `initialize` / `notifications/initialized` handshake.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::ProtocolVersion`] if the server picks a
    /// version outside [`SUPPORTED_PROTOCOL_VERSIONS`], and
    /// [`ConduitError::Protocol`] if it rejects the request.
    pub async fn initialize(
        &self,
        client_info: Implementation,
        capabilities: ClientCapabilities,
    ) -> Result<InitializeResponse> {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities,
            client_info,
        };
        let response: InitializeResponse = match self.fetch(METHOD_INITIALIZE, params).await {
            Ok(r) => r,
            Err(e) => match crate::error::classify(&e) {
                Some(ConduitError::Rpc { code, message }) => {
                    return Err(self.protocol_error(format!(
                        "initialize rejected ({code}): {message}"
                    )))
                }
                _ => return Err(e),
            },
        };

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&response.protocol_version.as_str()) {
            return Err(ConduitError::ProtocolVersion {
                expected: SUPPORTED_PROTOCOL_VERSIONS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                got: response.protocol_version,
            }
            .into());
        }

        self.client.notify(NOTIF_INITIALIZED, serde_json::Value::Null)?;
        Ok(response)
    }

    /// Fetch every page of a listing.
    async fn paginate<R, T>(
        &self,
        method: &str,
        split: impl Fn(R) -> (Vec<T>, Option<String>),
    ) -> Result<Vec<T>>
    where
        R: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            let page: R = self.fetch(method, PaginatedParams { cursor }).await?;
            let (batch, next) = split(page);
            items.extend(batch);

            match next {
                Some(c) if !c.is_empty() => {
                    if !seen.insert(c.clone()) {
                        return Err(self.protocol_error(format!("{method} repeated cursor '{c}'")));
                    }
                    cursor = Some(c);
                }
                _ => break,
            }
        }
        Ok(items)
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        self.paginate(METHOD_TOOLS_LIST, |r: ListToolsResponse| (r.tools, r.next_cursor))
            .await
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        self.paginate(METHOD_RESOURCES_LIST, |r: ListResourcesResponse| {
            (r.resources, r.next_cursor)
        })
        .await
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        self.paginate(METHOD_PROMPTS_LIST, |r: ListPromptsResponse| {
            (r.prompts, r.next_cursor)
        })
        .await
    }

    /// Send `tools/call`. JSON-RPC errors surface as [`ConduitError::Rpc`].
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<CallToolResponse> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
            meta: None,
        })?;
        let value = self
            .client
            .call(METHOD_TOOLS_CALL, Some(params), self.timeout, cancel)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| self.protocol_error(format!("malformed {METHOD_TOOLS_CALL} result: {e}")))
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>> {
        let response: ReadResourceResponse = self
            .fetch(
                METHOD_RESOURCES_READ,
                ReadResourceParams {
                    uri: uri.to_string(),
                },
            )
            .await?;
        Ok(response.contents)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResponse> {
        self.fetch(
            METHOD_PROMPTS_GET,
            GetPromptParams {
                name: name.to_string(),
                arguments,
            },
        )
        .await
    }

    pub async fn ping(&self) -> Result<()> {
        let _: serde_json::Value = self.fetch(METHOD_PING, serde_json::json!({})).await?;
        Ok(())
    }
}
