//! MCP subcommand handlers
//!
//! Each handler builds a [`ServerRegistry`] from the loaded configuration,
//! does its work through an [`McpAggregator`], and closes every session it
//! opened before returning. Elicitations are declined: the CLI has no
//! interactive form renderer.

use std::collections::HashMap;
use std::sync::Arc;

use prettytable::{format, row, Table};
use serde_json::Value;

use crate::config::Config;
use crate::error::{ConduitError, Result};
use crate::mcp::aggregator::{McpAggregator, NamespacedPrompt, NamespacedResource, NamespacedTool};
use crate::mcp::elicitation::AutoDecline;
use crate::mcp::registry::{ServerRegistry, ServerStatus};
use crate::mcp::session::SessionOptions;
use crate::mcp::types::{CallToolResponse, GetPromptResponse, ResourceContents, ToolResponseContent};

/// Build a registry for CLI use
///
/// # Arguments
///
/// * `config` - Loaded and validated configuration
///
/// # Returns
///
/// Returns a registry whose sessions decline every elicitation
pub fn build_registry(config: &Config) -> Arc<ServerRegistry> {
    let options = SessionOptions::from_config(&config.mcp).with_elicitation_handler(Arc::new(AutoDecline));
    Arc::new(ServerRegistry::with_options(config.mcp.clone(), options))
}

fn aggregator(registry: &Arc<ServerRegistry>, servers: Vec<String>) -> Result<McpAggregator> {
    if servers.is_empty() {
        Ok(McpAggregator::all(Arc::clone(registry)))
    } else {
        McpAggregator::new(Arc::clone(registry), servers)
    }
}

async fn shutdown(registry: &ServerRegistry) {
    let report = registry.close_all().await;
    for (server, error) in &report.failures {
        tracing::warn!(server = %server, error = %error, "failed to close session");
    }
}

/// Parse `--args` into a JSON object.
///
/// # Errors
///
/// Returns [`ConduitError::Config`] if the text is not a JSON object.
pub fn parse_tool_arguments(raw: Option<&str>) -> Result<Option<Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ConduitError::Config(format!("--args is not valid JSON: {e}")))?;
    if !value.is_object() {
        return Err(ConduitError::Config("--args must be a JSON object".to_string()).into());
    }
    Ok(Some(value))
}

/// Show configured servers
///
/// # Arguments
///
/// * `config` - Loaded configuration
/// * `connect` - Open every session first so the state column is live
pub async fn list_servers(config: &Config, connect: bool) -> Result<()> {
    let registry = build_registry(config);
    if connect {
        let report = McpAggregator::all(Arc::clone(&registry)).attach().await;
        for (server, error) in &report.failures {
            eprintln!("{server}: {error:#}");
        }
    }
    let status = registry.status();
    shutdown(&registry).await;

    if status.is_empty() {
        println!("No MCP servers configured.");
        return Ok(());
    }
    println!("\nMCP servers:");
    servers_table(&status).printstd();
    println!();
    Ok(())
}

fn servers_table(status: &[ServerStatus]) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
    table.set_titles(row!["Server", "Transport", "State"]);
    for s in status {
        table.add_row(row![s.name, s.transport, s.state]);
    }
    table
}

/// List tools across servers.
pub async fn list_tools(config: &Config, servers: Vec<String>) -> Result<()> {
    let registry = build_registry(config);
    let tools = aggregator(&registry, servers)?.list_tools().await;
    shutdown(&registry).await;

    if tools.is_empty() {
        println!("No tools available.");
        return Ok(());
    }
    println!("\nTools:");
    tools_table(&tools).printstd();
    println!();
    Ok(())
}

fn tools_table(tools: &[NamespacedTool]) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
    table.set_titles(row!["Tool", "Server", "Description"]);
    for t in tools {
        let description = t.tool.description.as_deref().unwrap_or("-");
        table.add_row(row![t.qualified_name, t.server, truncate(description, 60)]);
    }
    table
}

/// Call one tool and print its result.
pub async fn call_tool(config: &Config, tool: &str, args: Option<&str>) -> Result<()> {
    let arguments = parse_tool_arguments(args)?;
    let registry = build_registry(config);
    let aggregator = McpAggregator::all(Arc::clone(&registry));
    // Bare names resolve against the last listing.
    if !tool.contains(crate::mcp::config::QUALIFIED_NAME_SEPARATOR) {
        aggregator.list_tools().await;
    }
    let outcome = aggregator.call_tool(tool, arguments).await;
    shutdown(&registry).await;

    println!("{}", render_tool_result(&outcome?));
    Ok(())
}

fn render_tool_result(response: &CallToolResponse) -> String {
    let mut parts: Vec<String> = response
        .content
        .iter()
        .map(|item| match item {
            ToolResponseContent::Text { text } => text.clone(),
            ToolResponseContent::Image { mime_type, .. } => format!("[image {mime_type}]"),
            ToolResponseContent::Audio { mime_type, .. } => format!("[audio {mime_type}]"),
            ToolResponseContent::Resource { resource } => render_contents(resource),
            ToolResponseContent::ResourceLink { uri, .. } => format!("[link {uri}]"),
        })
        .collect();
    if let Some(structured) = &response.structured_content {
        parts.push(serde_json::to_string_pretty(structured).unwrap_or_else(|_| structured.to_string()));
    }
    parts.join("\n")
}

fn render_contents(contents: &ResourceContents) -> String {
    match contents {
        ResourceContents::Text { text, .. } => text.clone(),
        ResourceContents::Blob {
            uri,
            mime_type,
            blob,
        } => format!(
            "[blob {uri} {} ({} base64 chars)]",
            mime_type.as_deref().unwrap_or("application/octet-stream"),
            blob.len()
        ),
    }
}

/// List resources across servers.
pub async fn list_resources(config: &Config, servers: Vec<String>) -> Result<()> {
    let registry = build_registry(config);
    let resources = aggregator(&registry, servers)?.list_resources().await;
    shutdown(&registry).await;

    if resources.is_empty() {
        println!("No resources available.");
        return Ok(());
    }
    println!("\nResources:");
    resources_table(&resources).printstd();
    println!();
    Ok(())
}

fn resources_table(resources: &[NamespacedResource]) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
    table.set_titles(row!["Server", "URI", "Name", "MIME type"]);
    for r in resources {
        table.add_row(row![
            r.server,
            r.resource.uri,
            r.resource.name,
            r.resource.mime_type.as_deref().unwrap_or("-")
        ]);
    }
    table
}

/// Read one resource and print its contents.
pub async fn read_resource(config: &Config, server: &str, uri: &str) -> Result<()> {
    let registry = build_registry(config);
    let outcome = McpAggregator::new(Arc::clone(&registry), vec![server.to_string()])?
        .read_resource(server, uri)
        .await;
    shutdown(&registry).await;

    for contents in outcome? {
        println!("{}", render_contents(&contents));
    }
    Ok(())
}

/// List prompts across servers.
pub async fn list_prompts(config: &Config, servers: Vec<String>) -> Result<()> {
    let registry = build_registry(config);
    let prompts = aggregator(&registry, servers)?.list_prompts().await;
    shutdown(&registry).await;

    if prompts.is_empty() {
        println!("No prompts available.");
        return Ok(());
    }
    println!("\nPrompts:");
    prompts_table(&prompts).printstd();
    println!();
    Ok(())
}

fn prompts_table(prompts: &[NamespacedPrompt]) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
    table.set_titles(row!["Prompt", "Arguments", "Description"]);
    for p in prompts {
        let arguments = p
            .prompt
            .arguments
            .iter()
            .map(|a| {
                if a.required == Some(true) {
                    format!("{}*", a.name)
                } else {
                    a.name.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(row![
            p.qualified_name,
            arguments,
            truncate(p.prompt.description.as_deref().unwrap_or("-"), 60)
        ]);
    }
    table
}

/// Render one prompt and print its messages.
pub async fn render_prompt(config: &Config, name: &str, args: Vec<(String, String)>) -> Result<()> {
    let registry = build_registry(config);
    let aggregator = McpAggregator::all(Arc::clone(&registry));
    if !name.contains(crate::mcp::config::QUALIFIED_NAME_SEPARATOR) {
        aggregator.list_prompts().await;
    }
    let arguments: HashMap<String, String> = args.into_iter().collect();
    let outcome = aggregator.render_prompt(name, arguments).await;
    shutdown(&registry).await;

    println!("{}", render_prompt_messages(&outcome?));
    Ok(())
}

fn render_prompt_messages(response: &GetPromptResponse) -> String {
    response
        .messages
        .iter()
        .map(|m| {
            let body = match &m.content {
                ToolResponseContent::Text { text } => text.clone(),
                ToolResponseContent::Resource { resource } => render_contents(resource),
                other => format!("{other:?}"),
            };
            let role = format!("{:?}", m.role).to_lowercase();
            format!("{role}: {body}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}
