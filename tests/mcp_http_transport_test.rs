//! MCP HTTP transport integration tests
//!
//! Exercises the streamable HTTP and legacy HTTP+SSE transports against a
//! `wiremock` mock server, then runs a full session over streamable HTTP.
//!
//! # wiremock body helpers
//!
//! Use `set_body_raw(bytes, mime)` for SSE responses so that the
//! `Content-Type` is set to `text/event-stream` exactly.  `set_body_string`
//! forces `text/plain` and would cause the transport to fall through to the
//! JSON branch.  `set_body_json` forces `application/json`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use conduit::error::classify;
use conduit::mcp::config::{AuthConfig, AuthType, ServerConfig, TransportKind};
use conduit::mcp::session::{Session, SessionOptions, SessionState};
use conduit::mcp::transport::http::HttpTransport;
use conduit::mcp::transport::sse::SseTransport;
use conduit::mcp::transport::Transport;
use conduit::ConduitError;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn http_config(base_url: &str) -> ServerConfig {
    let mut cfg = ServerConfig::network("remote", TransportKind::StreamableHttp, base_url);
    cfg.http_timeout_seconds = 5;
    cfg.read_timeout_seconds = 5;
    cfg
}

/// Construct an `HttpTransport` pointing at the given wiremock base URL.
fn make_transport(base_url: &str) -> HttpTransport {
    HttpTransport::from_config(&http_config(base_url)).expect("valid config")
}

/// Collect all currently buffered messages from `receive()` with a short
/// deadline.  Stops as soon as one `timeout` fires or the stream ends.
async fn drain_receive(transport: &impl Transport, deadline: Duration) -> Vec<String> {
    use futures::StreamExt;

    let mut messages = Vec::new();
    let mut stream = transport.receive();

    while let Ok(Some(msg)) = tokio::time::timeout(deadline, stream.next()).await {
        messages.push(msg);
    }

    messages
}

fn json_body(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "application/json")
}

const INITIALIZE_RESULT: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-11-25","capabilities":{"tools":{}},"serverInfo":{"name":"test","version":"1.0"}}}"#;

// ---------------------------------------------------------------------------
// Streamable HTTP transport
// ---------------------------------------------------------------------------

/// POST with `application/json` response is forwarded to `receive()`.
#[tokio::test]
async fn test_post_with_json_response_forwarded_to_receive() {
    let server = MockServer::start().await;

    let body = r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#;

    Mock::given(method("POST"))
        .respond_with(json_body(body))
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri());
    transport
        .send(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{}}"#.to_string())
        .await
        .expect("send should succeed");

    let messages = drain_receive(&transport, Duration::from_millis(200)).await;
    assert_eq!(messages.len(), 1, "expected exactly one message");
    assert_eq!(messages[0], body);
}

/// A JSON array body is a batch and yields one message per element.
#[tokio::test]
async fn test_post_with_json_batch_split_into_messages() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(json_body(
            r#"[{"jsonrpc":"2.0","id":1,"result":{}},{"jsonrpc":"2.0","id":2,"result":{}}]"#,
        ))
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri());
    transport
        .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string())
        .await
        .unwrap();

    let messages = drain_receive(&transport, Duration::from_millis(200)).await;
    assert_eq!(messages.len(), 2, "got: {messages:?}");
    let second: Value = serde_json::from_str(&messages[1]).unwrap();
    assert_eq!(second["id"], 2);
}

/// POST with `text/event-stream` response forwards both SSE events to
/// `receive()`.
#[tokio::test]
async fn test_post_with_sse_two_events_both_forwarded() {
    let server = MockServer::start().await;

    let sse_body = concat!(
        "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"first\":true}}\n",
        "\n",
        "id: evt-2\n",
        "data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"second\":true}}\n",
        "\n",
    );

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri());
    transport
        .send(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#.to_string())
        .await
        .expect("send should succeed");

    let messages = drain_receive(&transport, Duration::from_millis(300)).await;
    assert_eq!(
        messages.len(),
        2,
        "expected two SSE events; got: {messages:?}"
    );

    let v1: Value = serde_json::from_str(&messages[0]).expect("valid JSON");
    let v2: Value = serde_json::from_str(&messages[1]).expect("valid JSON");
    assert_eq!(v1["result"]["first"], true);
    assert_eq!(v2["result"]["second"], true);
}

/// POST returning `202 Accepted` pushes nothing to `receive()`.
#[tokio::test]
async fn test_post_202_yields_nothing() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri());
    transport
        .send(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#.to_string())
        .await
        .expect("send should succeed");

    let messages = drain_receive(&transport, Duration::from_millis(100)).await;
    assert!(
        messages.is_empty(),
        "202 must not yield any message; got: {messages:?}"
    );
}

/// The first `202` opens the GET stream once, and its events reach `receive()`.
#[tokio::test]
async fn test_first_202_opens_get_stream_once() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(header("Accept", "text/event-stream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            b"data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/tools/list_changed\"}\n\n"
                .to_vec(),
            "text/event-stream",
        ))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    // The reopened stream is refused so only one event is ever delivered.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri());
    for _ in 0..2 {
        transport
            .send(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#.to_string())
            .await
            .unwrap();
    }

    let messages = drain_receive(&transport, Duration::from_millis(300)).await;
    assert_eq!(messages.len(), 1, "got: {messages:?}");
    assert!(messages[0].contains("list_changed"));
    server.verify().await;
}

/// A GET stream that ends is reopened with `Last-Event-ID` set to the last
/// event id it delivered.
#[tokio::test]
async fn test_get_stream_reopens_with_last_event_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            b"id: evt-1\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/tools/list_changed\"}\n\n"
                .to_vec(),
            "text/event-stream",
        ))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(header("Last-Event-ID", "evt-1"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            b"id: evt-2\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/prompts/list_changed\"}\n\n"
                .to_vec(),
            "text/event-stream",
        ))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri());
    transport
        .send(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#.to_string())
        .await
        .unwrap();

    let messages = drain_receive(&transport, Duration::from_secs(3)).await;
    assert_eq!(messages.len(), 2, "got: {messages:?}");
    assert!(messages[0].contains("tools/list_changed"));
    assert!(messages[1].contains("prompts/list_changed"));
    assert_eq!(transport.last_event_id().await.as_deref(), Some("evt-2"));
    server.verify().await;
}

/// Every POST carries `MCP-Protocol-Version: 2025-11-25`.
#[tokio::test]
async fn test_mcp_protocol_version_header_present_on_every_post() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header("MCP-Protocol-Version", "2025-11-25"))
        .respond_with(json_body(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#))
        .expect(2)
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri());

    transport
        .send(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#.to_string())
        .await
        .expect("first send should succeed");
    transport
        .send(r#"{"jsonrpc":"2.0","id":2,"method":"ping","params":{}}"#.to_string())
        .await
        .expect("second send should succeed");

    server.verify().await;
}

/// Configured headers and the auth credential ride on every POST.
#[tokio::test]
async fn test_configured_headers_and_bearer_auth_sent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header("Authorization", "Bearer secret-token"))
        .and(header("X-Tenant", "acme"))
        .respond_with(json_body(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#))
        .expect(1)
        .mount(&server)
        .await;

    let mut cfg = http_config(&server.uri());
    cfg.headers.insert("X-Tenant".to_string(), "acme".to_string());
    cfg.auth = Some(AuthConfig {
        auth_type: AuthType::Bearer,
        credential: Some("secret-token".to_string()),
        header: None,
    });
    let transport = HttpTransport::from_config(&cfg).unwrap();

    transport
        .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string())
        .await
        .expect("authorized send should succeed");
    server.verify().await;
}

/// Session ID is captured from the first response and sent on subsequent
/// requests.
#[tokio::test]
async fn test_session_id_captured_and_sent_on_subsequent_requests() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(wiremock::matchers::body_string_contains("initialize"))
        .respond_with(json_body(INITIALIZE_RESULT).insert_header("MCP-Session-Id", "test-session-1"))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(header("MCP-Session-Id", "test-session-1"))
        .and(wiremock::matchers::body_string_contains("tools/list"))
        .respond_with(json_body(r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}"#))
        .expect(1)
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri());
    assert_eq!(transport.session_id().await, None);

    transport
        .send(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#.to_string())
        .await
        .expect("initialize send should succeed");
    assert_eq!(
        transport.session_id().await.as_deref(),
        Some("test-session-1")
    );

    transport
        .send(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list","params":{}}"#.to_string())
        .await
        .expect("tools/list send should succeed");

    server.verify().await;
}

/// A `404` while a session is active is a lost connection and clears the id.
#[tokio::test]
async fn test_404_with_session_id_is_connection_lost() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(wiremock::matchers::body_string_contains("initialize"))
        .respond_with(json_body(INITIALIZE_RESULT).insert_header("MCP-Session-Id", "session-abc"))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(header("MCP-Session-Id", "session-abc"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri());

    transport
        .send(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#.to_string())
        .await
        .expect("initialize should succeed");

    let err = transport
        .send(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list","params":{}}"#.to_string())
        .await
        .expect_err("expected error on 404 with active session");
    assert!(
        matches!(classify(&err), Some(ConduitError::ConnectionLost { server }) if server == "remote"),
        "unexpected error: {err}"
    );
    assert_eq!(transport.session_id().await, None);
}

/// A `404` without a session is an ordinary transport failure.
#[tokio::test]
async fn test_404_without_session_is_transport_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri());
    let err = transport
        .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string())
        .await
        .unwrap_err();
    assert!(matches!(classify(&err), Some(ConduitError::Transport(_))));
}

/// SSE stream with `event: ping` followed by a real `data:` event delivers
/// only the real event.
#[tokio::test]
async fn test_ping_sse_events_are_silently_dropped() {
    let server = MockServer::start().await;

    let sse_body = concat!(
        "event: ping\n",
        "data: ignored-ping-payload\n",
        "\n",
        ": keep-alive comment\n",
        "data: [PING]\n",
        "\n",
        "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"real\":true}}\n",
        "\n",
    );

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri());
    transport
        .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":{}}"#.to_string())
        .await
        .expect("send should succeed");

    let messages = drain_receive(&transport, Duration::from_millis(300)).await;
    assert_eq!(
        messages.len(),
        1,
        "only the real event should be received; got: {messages:?}"
    );

    let v: Value = serde_json::from_str(&messages[0]).expect("valid JSON");
    assert_eq!(v["result"]["real"], true);
}

/// A `401 Unauthorized` response surfaces the `WWW-Authenticate` challenge.
#[tokio::test]
async fn test_401_returns_auth_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Bearer realm=\"mcp\""),
        )
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri());
    let err = transport
        .send(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#.to_string())
        .await
        .expect_err("expected error on 401");

    match classify(&err) {
        Some(ConduitError::Auth(challenge)) => assert!(challenge.contains("Bearer")),
        other => panic!("expected Auth error, got {other:?}"),
    }
}

/// Closing with a session sends `DELETE` carrying the session id; later
/// sends fail.
#[tokio::test]
async fn test_close_sends_delete_with_session_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(json_body(INITIALIZE_RESULT).insert_header("MCP-Session-Id", "bye-1"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(header("MCP-Session-Id", "bye-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri());
    transport
        .send(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#.to_string())
        .await
        .unwrap();

    transport.close().await.expect("close should succeed");
    transport.close().await.expect("second close is a no-op");
    assert!(transport
        .send(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#.to_string())
        .await
        .is_err());
    server.verify().await;
}

// ---------------------------------------------------------------------------
// Session over streamable HTTP
// ---------------------------------------------------------------------------

/// Answers JSON-RPC requests by echoing their id; notifications get `202`.
struct McpResponder {
    tools_list_calls: Arc<AtomicUsize>,
}

impl Respond for McpResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let Some(id) = body.get("id").cloned() else {
            return ResponseTemplate::new(202);
        };
        let result = match body["method"].as_str().unwrap_or_default() {
            "initialize" => json!({
                "protocolVersion": "2025-06-18",
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "remote-http", "version": "2.0.0"}
            }),
            "tools/list" => {
                self.tools_list_calls.fetch_add(1, Ordering::SeqCst);
                json!({"tools": [{
                    "name": "lookup",
                    "description": "Looks things up",
                    "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}
                }]})
            }
            "tools/call" => {
                let q = body["params"]["arguments"]["q"].as_str().unwrap_or_default();
                json!({"content": [{"type": "text", "text": format!("found {q}")}]})
            }
            _ => json!({}),
        };
        ResponseTemplate::new(200)
            .insert_header("MCP-Session-Id", "http-session-7")
            .set_body_json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }
}

#[tokio::test]
async fn test_session_over_streamable_http() {
    let server = MockServer::start().await;
    let tools_list_calls = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(McpResponder {
            tools_list_calls: Arc::clone(&tools_list_calls),
        })
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(header("MCP-Session-Id", "http-session-7"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let cfg = http_config(&format!("{}/mcp", server.uri()));
    let session = Session::start(cfg, SessionOptions::default())
        .await
        .expect("session over HTTP should start");

    assert_eq!(session.state(), SessionState::Ready);
    let info = session.server_info().unwrap();
    assert_eq!(info.protocol_version, "2025-06-18");
    assert_eq!(info.server_info.name, "remote-http");

    let tools = session.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "lookup");
    let again = session.list_tools().await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(tools_list_calls.load(Ordering::SeqCst), 1, "second listing is cached");

    // The server advertises no resources capability.
    assert!(session.list_resources().await.unwrap().is_empty());

    let out = session
        .call_tool("lookup", Some(json!({"q": "rust"})))
        .await
        .unwrap();
    assert_eq!(out.text(), "found rust");

    session.close().await.expect("close should succeed");
    assert_eq!(session.state(), SessionState::Closed);
    server.verify().await;
}

#[tokio::test]
async fn test_session_start_reports_auth_failure() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Bearer"))
        .mount(&server)
        .await;

    let err = Session::start(http_config(&server.uri()), SessionOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(classify(&err), Some(ConduitError::Auth(_))),
        "unexpected error: {err}"
    );
}

// ---------------------------------------------------------------------------
// Legacy HTTP+SSE transport
// ---------------------------------------------------------------------------

fn sse_config(base_url: &str) -> ServerConfig {
    let mut cfg = ServerConfig::network("legacy", TransportKind::Sse, base_url);
    cfg.http_timeout_seconds = 2;
    cfg.read_timeout_seconds = 5;
    cfg
}

#[tokio::test]
async fn test_sse_endpoint_resolved_and_messages_delivered() {
    let server = MockServer::start().await;

    let stream = concat!(
        "event: endpoint\n",
        "data: /messages?session=42\n",
        "\n",
        "event: message\n",
        "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/tools/list_changed\"}\n",
        "\n",
        "event: heartbeat\n",
        "data: ignored\n",
        "\n",
    );
    Mock::given(method("GET"))
        .and(path("/sse"))
        .and(header("Accept", "text/event-stream"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(stream.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(wiremock::matchers::query_param("session", "42"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let transport = SseTransport::connect(&sse_config(&format!("{}/sse", server.uri())))
        .await
        .expect("SSE connect should succeed");
    assert_eq!(
        transport.endpoint().as_str(),
        format!("{}/messages?session=42", server.uri())
    );

    let messages = drain_receive(&transport, Duration::from_millis(300)).await;
    assert_eq!(messages.len(), 1, "got: {messages:?}");
    assert!(messages[0].contains("list_changed"));

    transport
        .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string())
        .await
        .expect("POST to the announced endpoint should succeed");

    transport.close().await.unwrap();
    assert!(transport
        .send(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#.to_string())
        .await
        .is_err());
    server.verify().await;
}

#[tokio::test]
async fn test_sse_401_is_auth_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = SseTransport::connect(&sse_config(&server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(classify(&err), Some(ConduitError::Auth(_))));
}

#[tokio::test]
async fn test_sse_stream_without_endpoint_is_connection_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            b"event: message\ndata: {}\n\n".to_vec(),
            "text/event-stream",
        ))
        .mount(&server)
        .await;

    let err = SseTransport::connect(&sse_config(&server.uri()))
        .await
        .unwrap_err();
    assert!(
        matches!(classify(&err), Some(ConduitError::Connection { .. })),
        "unexpected error: {err}"
    );
}
