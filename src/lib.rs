//! Conduit - MCP client library
//!
//! This library connects to Model Context Protocol servers over stdio,
//! HTTP+SSE, WebSocket, and streamable HTTP, supervises one session per
//! server, and presents their tools, resources, and prompts as one catalog.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `mcp`: transports, sessions, the server registry, and the aggregator
//! - `config`: Configuration loading and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//! - `commands`: CLI command handlers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use conduit::Config;
//! use conduit::mcp::{McpAggregator, ServerRegistry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("conduit.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let registry = Arc::new(ServerRegistry::new(config.mcp));
//!     let aggregator = McpAggregator::all(Arc::clone(&registry));
//!     for tool in aggregator.list_tools().await {
//!         println!("{}", tool.qualified_name);
//!     }
//!     registry.close_all().await;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod mcp;

// Re-export commonly used types
pub use config::Config;
pub use error::{ConduitError, Result};

#[cfg(test)]
pub mod test_utils;
