//! Conduit - MCP client CLI
//!
#![doc = "Conduit - MCP client CLI"]
#![doc = "Main entry point for the conduit application."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use conduit::cli::{Cli, Commands};
use conduit::commands;
use conduit::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(cli.verbose);
    conduit::mcp::metrics::init_metrics_exporter();

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("conduit.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Servers { connect } => {
            tracing::debug!(connect, "listing servers");
            commands::mcp::list_servers(&config, connect).await
        }
        Commands::Tools { servers } => commands::mcp::list_tools(&config, servers).await,
        Commands::Call { tool, args } => {
            tracing::info!(tool = %tool, "calling tool");
            commands::mcp::call_tool(&config, &tool, args.as_deref()).await
        }
        Commands::Resources { servers } => commands::mcp::list_resources(&config, servers).await,
        Commands::Read { server, uri } => commands::mcp::read_resource(&config, &server, &uri).await,
        Commands::Prompts { servers } => commands::mcp::list_prompts(&config, servers).await,
        Commands::Prompt { name, args } => commands::mcp::render_prompt(&config, &name, args).await,
    }
}

/// Initialize tracing subscriber with environment filter
///
/// Logs go to stderr so command output on stdout stays clean.
fn init_tracing(verbose: bool) {
    let default = if verbose { "conduit=debug" } else { "conduit=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
