use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use toolbridge_config::BridgeConfig;
use toolbridge_core::Tool;
use toolbridge_mcp::{create_tools, CreateToolsOptions, McpToolSet};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "toolbridge")]
#[command(about = "Expose MCP server tools as locally callable tools", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE", default_value = "toolbridge.yaml")]
    config: PathBuf,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every bridged tool
    Tools,

    /// Execute one bridged tool
    Call {
        /// Local tool name, e.g. mcp_files_read_file
        name: String,

        /// Tool arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let config = if cli.config.exists() {
        info!("Loading configuration from: {:?}", cli.config);
        BridgeConfig::from_yaml(&cli.config)?
    } else {
        info!("Using default configuration");
        BridgeConfig::default()
    };

    let tool_set = create_tools(CreateToolsOptions {
        workspace_dir: config.workspace_dir.clone(),
        server_declarations: config.servers.clone(),
        timeouts: config.timeouts,
    })
    .await;

    let outcome = match cli.command {
        Commands::Tools => {
            list_tools(&tool_set);
            Ok(())
        }
        Commands::Call { name, args } => call_tool(&tool_set, &name, args.as_deref()).await,
    };

    tool_set.cleanup().await;
    outcome
}

fn list_tools(tool_set: &McpToolSet) {
    println!("\n🛠️  Available Tools:");
    println!("═══════════════════════════════════════");

    if tool_set.tools().is_empty() {
        println!("\n(no tools discovered)");
    }
    for tool in tool_set.tools() {
        println!("\n📦 {}  [{}]", tool.name(), tool.label());
        println!("   {}", tool.description());
        println!("   schema: {}", tool.schema());
    }
    println!();
}

async fn call_tool(tool_set: &McpToolSet, name: &str, args: Option<&str>) -> Result<()> {
    let tool = tool_set
        .get(name)
        .ok_or_else(|| anyhow!("Unknown tool: {}", name))?;

    let args: Value = match args {
        Some(raw) => serde_json::from_str(raw).context("--args must be valid JSON")?,
        None => Value::Object(Default::default()),
    };

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling tool call");
            on_ctrl_c.cancel();
        }
    });

    info!("Calling tool: {}", tool.name());
    let result = tool.execute(args, Some(cancel)).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose { "debug" } else { "info" };

    // stdout carries tool output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
