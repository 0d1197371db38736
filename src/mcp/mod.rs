//! MCP (Model Context Protocol) client
//!
//! Connects to MCP servers over stdio, HTTP+SSE, WebSocket, or streamable
//! HTTP, keeps one supervised [`session::Session`] per server, and exposes
//! their tools, resources, and prompts through a single
//! [`aggregator::McpAggregator`].
//!
//! The implementation targets protocol revision **2025-11-25** and accepts
//! 2025-06-18, 2025-03-26, and 2024-11-05 from servers.
//!
//! # Module Layout
//!
//! - `types`       -- protocol types and JSON-RPC primitives
//! - `config`      -- server entries and reconnect policy
//! - `transport`   -- `Transport` trait and the concrete adapters
//! - `client`      -- JSON-RPC correlation and the read loop
//! - `protocol`    -- typed MCP requests over `JsonRpcClient`
//! - `cache`       -- generation-checked capability listings
//! - `elicitation` -- schema checking and the handler seam
//! - `metrics`     -- tool call and lifecycle counters
//! - `session`     -- one supervised connection
//! - `registry`    -- named sessions with single-flight creation
//! - `aggregator`  -- one catalog over several servers

pub mod aggregator;
pub mod cache;
pub mod client;
pub mod config;
pub mod elicitation;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

pub use aggregator::{McpAggregator, NamespacedTool};
pub use config::{McpConfig, ServerConfig, TransportKind};
pub use elicitation::{AutoDecline, ElicitationHandler, ElicitationOutcome};
pub use registry::{CloseReport, ServerRegistry};
pub use session::{Session, SessionOptions, SessionState};
