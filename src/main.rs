use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use mcp_bridge::{init_tracing, load_config, BridgeConfig, BridgeTarget, LogFormat, McpBridge};

#[derive(Parser)]
#[command(name = "mcp-bridge")]
#[command(about = "Call tools on an MCP server over stdio or HTTP")]
#[command(version)]
struct Cli {
    /// YAML config file (defaults to MCP_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the server's tools
    ListTools,
    /// Call a tool and print its result
    Call {
        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },
    /// Connect, handshake, and print server info
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    });

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => BridgeConfig::from_env()?,
    };
    let target = config.target()?;
    let bridge = McpBridge::new(config.options());

    let outcome = tokio::select! {
        result = run(&bridge, target, cli.command) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow!("interrupted")),
    };

    bridge.shutdown().await;

    let output = outcome?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(bridge: &McpBridge, target: BridgeTarget, command: Commands) -> Result<serde_json::Value> {
    // Parse arguments before spawning anything.
    let call_args = match &command {
        Commands::Call { args, .. } => Some(
            serde_json::from_str::<serde_json::Value>(args)
                .with_context(|| format!("--args is not valid JSON: {args}"))?,
        ),
        _ => None,
    };

    bridge.initialize(target).await?;

    match command {
        Commands::ListTools => {
            let tools = bridge.list_tools().await;
            Ok(serde_json::to_value(tools)?)
        }
        Commands::Call { tool, .. } => {
            let arguments = call_args.unwrap_or_else(|| serde_json::json!({}));
            let result = bridge
                .call_tool(&tool, arguments)
                .await
                .with_context(|| format!("tool '{tool}' failed"))?;
            Ok(result)
        }
        Commands::Ping => Ok(serde_json::json!({
            "state": bridge.state(),
            "transport": bridge.transport_kind(),
            "server": bridge.server_info(),
            "capabilities": bridge.server_capabilities(),
        })),
    }
}
