//! MCP test server binary for integration tests
//!
//! A minimal MCP server speaking newline-delimited JSON over stdin/stdout.
//! Integration tests launch it through the stdio transport so the whole
//! client stack runs against a real child process.
//!
//! # Arguments
//!
//! - `--name <label>` -- reported as `serverInfo.name` and by `whoami`
//!   (default `mcp-test-server`).
//! - `--protocol-version <v>` -- version answered to `initialize`
//!   (default `2025-11-25`).
//!
//! # Handled Methods
//!
//! - `initialize` -- advertises tools, resources, prompts, and logging.
//! - `ping` -- empty result.
//! - `tools/list` -- `echo`, `add`, `whoami`, `ask`, `exit`, `notify`.
//! - `tools/call`:
//!   - `echo` returns `arguments.message`.
//!   - `add` returns `a + b`.
//!   - `whoami` returns the server label.
//!   - `ask` sends `elicitation/create` and answers once the client replies.
//!   - `exit` terminates the process without answering.
//!   - `notify` sends `notifications/tools/list_changed` and a log message,
//!     then answers `ok`.
//! - `resources/list`, `resources/read`, `prompts/list`, `prompts/get`.
//! - All other methods -- JSON-RPC `-32601 Method not found`.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};

use serde_json::{json, Value};

struct Server {
    name: String,
    protocol_version: String,
    next_request: u64,
    /// Server request id -> tools/call id waiting on it.
    awaiting: HashMap<String, Value>,
}

fn main() {
    let mut server = Server::from_args(std::env::args().skip(1).collect());
    eprintln!("mcp_test_server '{}' ready", server.name);

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                let response = make_error(&Value::Null, -32700, "Parse error");
                if send(&mut out, &response).is_err() {
                    break;
                }
                continue;
            }
        };

        for outgoing in server.handle(&message) {
            if send(&mut out, &outgoing).is_err() {
                return;
            }
        }
    }
}

fn send(out: &mut impl Write, message: &Value) -> io::Result<()> {
    writeln!(out, "{}", message)?;
    out.flush()
}

impl Server {
    fn from_args(args: Vec<String>) -> Self {
        let mut name = "mcp-test-server".to_string();
        let mut protocol_version = "2025-11-25".to_string();
        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--name" => name = iter.next().unwrap_or(name),
                "--protocol-version" => protocol_version = iter.next().unwrap_or(protocol_version),
                _ => {}
            }
        }
        Self {
            name,
            protocol_version,
            next_request: 0,
            awaiting: HashMap::new(),
        }
    }

    /// Messages to write in response to one inbound message.
    fn handle(&mut self, message: &Value) -> Vec<Value> {
        let id = message.get("id").cloned().unwrap_or(Value::Null);

        let Some(method) = message.get("method").and_then(Value::as_str) else {
            // Reply to a request we sent.
            let key = id.as_str().unwrap_or_default().to_string();
            return match self.awaiting.remove(&key) {
                Some(call_id) => vec![text_result(&call_id, &summarize_elicitation(message))],
                None => vec![],
            };
        };

        // Notifications get no response.
        if message.get("id").is_none() {
            return vec![];
        }

        match method {
            "initialize" => vec![self.handle_initialize(&id)],
            "ping" => vec![make_result(&id, json!({}))],
            "tools/list" => vec![handle_tools_list(&id)],
            "tools/call" => self.handle_tools_call(&id, message),
            "resources/list" => vec![make_result(
                &id,
                json!({"resources": [{
                    "uri": format!("test://{}/readme", self.name),
                    "name": "readme",
                    "mimeType": "text/plain"
                }]}),
            )],
            "resources/read" => {
                let uri = message["params"]["uri"].as_str().unwrap_or_default();
                vec![make_result(
                    &id,
                    json!({"contents": [{"uri": uri, "mimeType": "text/plain", "text": format!("contents of {uri}")}]}),
                )]
            }
            "prompts/list" => vec![make_result(
                &id,
                json!({"prompts": [{
                    "name": "greet",
                    "description": "Greets someone",
                    "arguments": [{"name": "name", "required": true}]
                }]}),
            )],
            "prompts/get" => {
                let who = message["params"]["arguments"]["name"].as_str().unwrap_or("stranger");
                vec![make_result(
                    &id,
                    json!({"messages": [{"role": "user", "content": {"type": "text", "text": format!("Hello, {who}!")}}]}),
                )]
            }
            _ => vec![make_error(&id, -32601, &format!("Method not found: {}", method))],
        }
    }

    fn handle_initialize(&self, id: &Value) -> Value {
        make_result(
            id,
            json!({
                "protocolVersion": self.protocol_version,
                "capabilities": {
                    "tools": {"listChanged": true},
                    "resources": {},
                    "prompts": {},
                    "logging": {}
                },
                "serverInfo": {"name": self.name, "version": "0.1.0"}
            }),
        )
    }

    fn handle_tools_call(&mut self, id: &Value, request: &Value) -> Vec<Value> {
        let params = request.get("params").unwrap_or(&Value::Null);
        let tool_name = params.get("name").and_then(Value::as_str).unwrap_or("");
        let arguments = params.get("arguments").unwrap_or(&Value::Null);

        match tool_name {
            "echo" => {
                let message = arguments.get("message").and_then(Value::as_str).unwrap_or("");
                vec![text_result(id, message)]
            }
            "add" => {
                let a = arguments.get("a").and_then(Value::as_f64).unwrap_or(0.0);
                let b = arguments.get("b").and_then(Value::as_f64).unwrap_or(0.0);
                vec![text_result(id, &(a + b).to_string())]
            }
            "whoami" => vec![text_result(id, &self.name)],
            "ask" => {
                self.next_request += 1;
                let key = format!("elicit-{}", self.next_request);
                self.awaiting.insert(key.clone(), id.clone());
                vec![json!({
                    "jsonrpc": "2.0",
                    "id": key,
                    "method": "elicitation/create",
                    "params": {
                        "message": "Which color?",
                        "requestedSchema": {
                            "type": "object",
                            "properties": {"color": {"type": "string", "enum": ["red", "green"]}},
                            "required": ["color"]
                        },
                        "_meta": {"relatedRequestId": id}
                    }
                })]
            }
            "exit" => std::process::exit(0),
            "notify" => vec![
                json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}),
                json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/message",
                    "params": {"level": "info", "logger": "test", "data": "tools changed"}
                }),
                text_result(id, "ok"),
            ],
            _ => vec![make_error(id, -32602, &format!("Unknown tool: {}", tool_name))],
        }
    }
}

/// Handle the `tools/list` request.
fn handle_tools_list(id: &Value) -> Value {
    let tool = |name: &str, description: &str, properties: Value| {
        json!({
            "name": name,
            "description": description,
            "inputSchema": {"type": "object", "properties": properties}
        })
    };
    make_result(
        id,
        json!({"tools": [
            tool("echo", "Echoes input", json!({"message": {"type": "string"}})),
            tool("add", "Adds two numbers", json!({"a": {"type": "number"}, "b": {"type": "number"}})),
            tool("whoami", "Reports the server label", json!({})),
            tool("ask", "Asks the user a question", json!({})),
            tool("exit", "Terminates the server", json!({})),
            tool("notify", "Announces a tool list change", json!({}))
        ]}),
    )
}

fn summarize_elicitation(reply: &Value) -> String {
    if let Some(code) = reply["error"]["code"].as_i64() {
        return format!("error {code}");
    }
    match reply["result"]["action"].as_str() {
        Some("accept") => format!("accepted {}", reply["result"]["content"]),
        Some(action) => action.to_string(),
        None => "malformed".to_string(),
    }
}

fn text_result(id: &Value, text: &str) -> Value {
    make_result(id, json!({"content": [{"type": "text", "text": text}], "isError": false}))
}

fn make_result(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

/// Build a JSON-RPC error response.
fn make_error(id: &Value, code: i32, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message
        }
    })
}
