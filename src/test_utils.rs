//! Test utilities for conduit
//!
//! Temporary-file helpers plus [`FakeServer`], a scripted MCP server that
//! talks to sessions over [`MemoryTransport`] pairs.
//!
//! # Fake server tools
//!
//! | tool         | behavior                                                     |
//! |--------------|--------------------------------------------------------------|
//! | `echo`       | returns `arguments.text`                                     |
//! | `hang`       | never answers                                                |
//! | `fail`       | result with `isError: true` and text `tool failed`           |
//! | `ask`        | elicits `{name: string}`, then reports the client's answer   |
//! | `ask_nested` | elicits with a nested object schema                          |
//! | `roots`      | asks the client for `roots/list`, returns the URIs           |
//! | `garbled`    | result whose `content` is not an array                       |
//!
//! Custom tool lists (see [`FakeServer::with_tools`]) answer any listed tool
//! with `<server label>:<tool>`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::error::{ConduitError, Result};
use crate::mcp::client::BoxFuture;
use crate::mcp::config::ServerConfig;
use crate::mcp::session::Connector;
use crate::mcp::transport::memory::{MemoryPeer, MemoryTransport};
use crate::mcp::transport::AnyTransport;
use crate::mcp::types::LATEST_PROTOCOL_VERSION;

/// Create a temporary directory for testing
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temporary directory")
}

/// Create a test file with the given content
pub fn create_test_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Assert that an error's chain mentions `expected`
///
/// # Panics
///
/// Panics if the result is Ok or the message does not match.
pub fn assert_error_contains<T: std::fmt::Debug>(result: Result<T>, expected: &str) {
    match result {
        Ok(v) => panic!("expected error containing '{expected}', got Ok({v:?})"),
        Err(e) => {
            let msg = format!("{e:#}");
            assert!(msg.contains(expected), "error '{msg}' does not contain '{expected}'");
        }
    }
}

/// What a server-initiated request was for.
enum Awaiting {
    Elicitation,
    Roots,
}

struct FakeState {
    label: String,
    protocol_version: String,
    tools: Option<Vec<String>>,
    fail_listing: bool,
    counts: Mutex<HashMap<String, usize>>,
    /// Generation and sender of the current connection.
    link: Mutex<Option<(u64, mpsc::UnboundedSender<String>)>>,
    generation: AtomicU64,
    last_elicitation_reply: Mutex<Option<Value>>,
}

/// Scripted in-process MCP server. Clones share state.
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<FakeState>,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::build("fake", LATEST_PROTOCOL_VERSION, None, false)
    }
}

impl FakeServer {
    fn build(label: &str, version: &str, tools: Option<Vec<String>>, fail_listing: bool) -> Self {
        Self {
            state: Arc::new(FakeState {
                label: label.to_string(),
                protocol_version: version.to_string(),
                tools,
                fail_listing,
                counts: Mutex::new(HashMap::new()),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                last_elicitation_reply: Mutex::new(None),
            }),
        }
    }

    /// A server that answers `initialize` with `version`.
    pub fn with_protocol_version(version: &str) -> Self {
        Self::build("fake", version, None, false)
    }

    /// A server named `label` offering exactly `tools`.
    pub fn with_tools(label: &str, tools: &[&str]) -> Self {
        Self::build(
            label,
            LATEST_PROTOCOL_VERSION,
            Some(tools.iter().map(|t| t.to_string()).collect()),
            false,
        )
    }

    /// A server whose `tools/list`, `resources/list`, and `prompts/list` fail.
    pub fn failing_lists(label: &str) -> Self {
        Self::build(label, LATEST_PROTOCOL_VERSION, Some(vec![]), true)
    }

    /// Messages received with `method`, across all connections.
    pub fn count(&self, method: &str) -> usize {
        self.state
            .counts
            .lock()
            .unwrap()
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    /// The client's most recent answer to an elicitation.
    pub fn last_elicitation_reply(&self) -> Option<Value> {
        self.state.last_elicitation_reply.lock().unwrap().clone()
    }

    /// Push a notification to the connected client.
    pub fn notify(&self, method: &str, params: Value) {
        self.send_raw(&json!({"jsonrpc": "2.0", "method": method, "params": params}).to_string());
    }

    /// Push raw text to the connected client.
    pub fn send_raw(&self, text: &str) {
        if let Some((_, tx)) = self.state.link.lock().unwrap().as_ref() {
            let _ = tx.send(text.to_string());
        }
    }

    /// Drop the current connection as if the server went away.
    pub fn disconnect(&self) {
        self.state.link.lock().unwrap().take();
    }

    /// Serve one client connection.
    pub fn attach(&self, peer: MemoryPeer) {
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.link.lock().unwrap() = Some((generation, peer.inbound_tx));
        let server = self.clone();
        tokio::spawn(server.serve(generation, peer.outbound_rx));
    }

    fn send(&self, generation: u64, value: Value) {
        if let Some((current, tx)) = self.state.link.lock().unwrap().as_ref() {
            if *current == generation {
                let _ = tx.send(value.to_string());
            }
        }
    }

    fn offers(&self, tool: &str) -> bool {
        match &self.state.tools {
            Some(tools) => tools.iter().any(|t| t == tool),
            None => true,
        }
    }

    fn tool_list(&self) -> Vec<Value> {
        let names: Vec<String> = match &self.state.tools {
            Some(tools) => tools.clone(),
            None => ["echo", "hang", "fail", "ask", "ask_nested", "roots"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        names
            .into_iter()
            .map(|name| {
                json!({
                    "name": name,
                    "description": format!("{name} from {}", self.state.label),
                    "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}
                })
            })
            .collect()
    }

    async fn serve(self, generation: u64, mut outbound_rx: mpsc::UnboundedReceiver<String>) {
        let mut awaiting: HashMap<String, (Value, Awaiting)> = HashMap::new();
        let mut next_id = 0u64;

        while let Some(raw) = outbound_rx.recv().await {
            let Ok(msg) = serde_json::from_str::<Value>(&raw) else {
                continue;
            };
            let Some(method) = msg.get("method").and_then(Value::as_str) else {
                // Reply to one of our own requests.
                let key = msg["id"].as_str().unwrap_or_default().to_string();
                if let Some((call_id, kind)) = awaiting.remove(&key) {
                    let text = match kind {
                        Awaiting::Elicitation => {
                            *self.state.last_elicitation_reply.lock().unwrap() = Some(msg.clone());
                            elicitation_summary(&msg)
                        }
                        Awaiting::Roots => msg["result"]["roots"]
                            .as_array()
                            .map(|roots| {
                                roots
                                    .iter()
                                    .filter_map(|r| r["uri"].as_str())
                                    .collect::<Vec<_>>()
                                    .join(",")
                            })
                            .unwrap_or_default(),
                    };
                    self.send(generation, text_result(call_id, &text));
                }
                continue;
            };

            *self
                .state
                .counts
                .lock()
                .unwrap()
                .entry(method.to_string())
                .or_insert(0) += 1;

            let Some(id) = msg.get("id").cloned() else {
                continue;
            };
            let params = msg.get("params").cloned().unwrap_or(Value::Null);

            let reply = match method {
                "initialize" => Some(result(
                    id,
                    json!({
                        "protocolVersion": self.state.protocol_version,
                        "capabilities": {
                            "tools": {"listChanged": true},
                            "resources": {},
                            "prompts": {},
                            "logging": {}
                        },
                        "serverInfo": {"name": self.state.label, "version": "0.1.0"}
                    }),
                )),
                "ping" => Some(result(id, json!({}))),
                "tools/list" | "resources/list" | "prompts/list" if self.state.fail_listing => {
                    Some(error(id, -32603, "listing unavailable"))
                }
                "tools/list" => Some(result(id, json!({"tools": self.tool_list()}))),
                "resources/list" => Some(result(
                    id,
                    json!({"resources": [{"uri": "mem://readme", "name": "readme", "mimeType": "text/plain"}]}),
                )),
                "resources/read" => Some(result(
                    id,
                    json!({"contents": [{"uri": params["uri"], "text": "hello"}]}),
                )),
                "prompts/list" => Some(result(
                    id,
                    json!({"prompts": [{"name": "greet", "arguments": [{"name": "name", "required": true}]}]}),
                )),
                "prompts/get" => {
                    let name = params["arguments"]["name"].as_str().unwrap_or("there");
                    Some(result(
                        id,
                        json!({"messages": [{"role": "user", "content": {"type": "text", "text": format!("Hello {name}")}}]}),
                    ))
                }
                "tools/call" => {
                    let tool = params["name"].as_str().unwrap_or_default().to_string();
                    match tool.as_str() {
                        _ if !self.offers(&tool) => {
                            Some(error(id, -32602, &format!("unknown tool: {tool}")))
                        }
                        _ if self.state.tools.is_some() => {
                            Some(text_result(id, &format!("{}:{tool}", self.state.label)))
                        }
                        "echo" => {
                            let text = params["arguments"]["text"].as_str().unwrap_or_default();
                            Some(text_result(id, text))
                        }
                        "hang" => None,
                        "garbled" => Some(result(id, json!({"content": "not-an-array"}))),
                        "fail" => Some(result(
                            id,
                            json!({"content": [{"type": "text", "text": "tool failed"}], "isError": true}),
                        )),
                        "ask" | "ask_nested" => {
                            next_id += 1;
                            let key = format!("srv-{next_id}");
                            let schema = if tool == "ask" {
                                json!({"type": "object", "properties": {"name": {"type": "string"}}, "required": ["name"]})
                            } else {
                                json!({"type": "object", "properties": {"address": {"type": "object", "properties": {"city": {"type": "string"}}}}})
                            };
                            self.send(
                                generation,
                                json!({
                                    "jsonrpc": "2.0",
                                    "id": key,
                                    "method": "elicitation/create",
                                    "params": {
                                        "message": "Who are you?",
                                        "requestedSchema": schema,
                                        "_meta": {"relatedRequestId": id}
                                    }
                                }),
                            );
                            awaiting.insert(key, (id, Awaiting::Elicitation));
                            None
                        }
                        "roots" => {
                            next_id += 1;
                            let key = format!("srv-{next_id}");
                            self.send(
                                generation,
                                json!({"jsonrpc": "2.0", "id": key, "method": "roots/list"}),
                            );
                            awaiting.insert(key, (id, Awaiting::Roots));
                            None
                        }
                        _ => Some(error(id, -32602, &format!("unknown tool: {tool}"))),
                    }
                }
                _ => Some(error(id, -32601, "method not found")),
            };

            if let Some(reply) = reply {
                self.send(generation, reply);
            }
        }
    }
}

fn result(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

fn text_result(id: Value, text: &str) -> Value {
    result(id, json!({"content": [{"type": "text", "text": text}]}))
}

fn elicitation_summary(reply: &Value) -> String {
    if let Some(code) = reply["error"]["code"].as_i64() {
        return format!("error:{code}");
    }
    match reply["result"]["action"].as_str() {
        Some("accept") => format!("accept:{}", reply["result"]["content"]),
        Some(other) => other.to_string(),
        None => "malformed".to_string(),
    }
}

/// Connector that serves every connection from `server`.
pub fn memory_connector(server: FakeServer) -> (Connector, FakeServer) {
    let handle = server.clone();
    let connector = memory_connector_map(vec![("*", server)]);
    (connector, handle)
}

/// Connector that picks a fake server by server name; `"*"` matches any.
pub fn memory_connector_map(servers: Vec<(&str, FakeServer)>) -> Connector {
    let servers: HashMap<String, FakeServer> = servers
        .into_iter()
        .map(|(name, server)| (name.to_string(), server))
        .collect();
    let servers = Arc::new(servers);
    Arc::new(
        move |config: Arc<ServerConfig>| -> BoxFuture<'static, Result<AnyTransport>> {
            let servers = Arc::clone(&servers);
            Box::pin(async move {
                let server = servers
                    .get(&config.name)
                    .or_else(|| servers.get("*"))
                    .cloned()
                    .ok_or_else(|| ConduitError::Connection {
                        server: config.name.clone(),
                        message: "no such fake server".to_string(),
                    })?;
                let (transport, peer) = MemoryTransport::pair();
                server.attach(peer);
                Ok(AnyTransport::from(transport))
            })
        },
    )
}

/// Wrap `inner` so that every connection after the first waits `delay`.
pub fn slow_reconnects(inner: Connector, delay: Duration) -> Connector {
    let calls = Arc::new(AtomicU64::new(0));
    Arc::new(
        move |config: Arc<ServerConfig>| -> BoxFuture<'static, Result<AnyTransport>> {
            let inner = Arc::clone(&inner);
            let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
            Box::pin(async move {
                if !first {
                    tokio::time::sleep(delay).await;
                }
                (inner)(config).await
            })
        },
    )
}
