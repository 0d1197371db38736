//! Command-line interface definition for Conduit
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands to inspect configured MCP servers and invoke their
//! tools, resources, and prompts.

use clap::{Parser, Subcommand};

/// Conduit - MCP client
///
/// Connect to the MCP servers listed in the configuration file and use
/// their capabilities from the shell.
#[derive(Parser, Debug, Clone)]
#[command(name = "conduit")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "conduit.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for Conduit
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Show configured servers and their session state
    Servers {
        /// Connect to every server before reporting
        #[arg(long)]
        connect: bool,
    },

    /// List tools across servers
    Tools {
        /// Restrict to these servers (repeatable)
        #[arg(short, long = "server")]
        servers: Vec<String>,
    },

    /// Call a tool by qualified (`server__tool`) or unambiguous bare name
    Call {
        /// Tool name
        tool: String,

        /// Arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
    },

    /// List resources across servers
    Resources {
        /// Restrict to these servers (repeatable)
        #[arg(short, long = "server")]
        servers: Vec<String>,
    },

    /// Read one resource
    Read {
        /// Server name
        server: String,

        /// Resource URI
        uri: String,
    },

    /// List prompts across servers
    Prompts {
        /// Restrict to these servers (repeatable)
        #[arg(short, long = "server")]
        servers: Vec<String>,
    },

    /// Render a prompt by qualified or unambiguous bare name
    Prompt {
        /// Prompt name
        name: String,

        /// Prompt argument as KEY=VALUE (repeatable)
        #[arg(short, long = "arg", value_parser = parse_key_value)]
        args: Vec<(String, String)>,
    },
}

/// Parse a `KEY=VALUE` argument.
fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("conduit.yaml".to_string()),
            verbose: false,
            command: Commands::Servers { connect: false },
        }
    }
}
