//! Configuration management for Conduit
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.
//! `${VAR}` references inside the YAML are resolved before parsing, so the
//! MCP core only ever sees literal strings.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConduitError, Result};
use crate::mcp::config::McpConfig;

/// Main configuration structure for Conduit
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// MCP client and server registry configuration
    #[serde(default)]
    pub mcp: McpConfig,
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// A missing file yields the default (empty) configuration with a
    /// warning. The result is normalized but not validated; call
    /// [`Config::validate`] before handing it to a registry.
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Config`] if the file cannot be read, a
    /// referenced environment variable is unset, or the YAML is malformed.
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);
        config.mcp.normalize();

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConduitError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml_str(&contents)
    }

    /// Parse configuration text after `${VAR}` substitution.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let expanded = substitute_env_vars(contents)?;
        let mut config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| ConduitError::Config(format!("Failed to parse config: {}", e)))?;
        config.mcp.normalize();
        Ok(config)
    }

    fn apply_env_vars(&mut self) {
        if let Ok(name) = std::env::var("CONDUIT_CLIENT_NAME") {
            self.mcp.client_name = name;
        }

        if let Ok(attempts) = std::env::var("CONDUIT_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(value) = attempts.parse() {
                self.mcp.reconnect.max_attempts = value;
            } else {
                tracing::warn!("Invalid CONDUIT_MAX_RECONNECT_ATTEMPTS: {}", attempts);
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConduitError::Config`] for the first invalid server entry.
    pub fn validate(&self) -> Result<()> {
        self.mcp.validate()
    }
}

/// Replace every `${NAME}` with the value of environment variable `NAME`.
///
/// `$${NAME}` escapes to a literal `${NAME}`.
///
/// # Errors
///
/// Returns [`ConduitError::Config`] naming the first unset variable.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let pattern = Regex::new(r"\$?\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConduitError::Config(format!("invalid substitution pattern: {e}")))?;

    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in pattern.captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&input[last..whole.start()]);
        last = whole.end();

        let name = &caps[1];
        if whole.as_str().starts_with("$$") {
            out.push_str(&whole.as_str()[1..]);
            continue;
        }
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                return Err(ConduitError::Config(format!(
                    "environment variable '{name}' referenced in config is not set"
                ))
                .into())
            }
        }
    }
    out.push_str(&input[last..]);
    Ok(out)
}
