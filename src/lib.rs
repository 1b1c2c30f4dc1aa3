//! JSON-RPC 2.0 bridge to a single MCP server.
//!
//! [`McpBridge`] speaks to the server over a child process's stdio or over
//! HTTP, correlates responses to requests, and closes cleanly when the
//! channel is lost. The `mcp-bridge` binary is a thin CLI over it.

pub mod bridge;

pub use bridge::{
    load_config, BridgeConfig, BridgeError, BridgeOptions, BridgeState, BridgeTarget, McpBridge,
    ToolDescriptor,
};

/// Output format for diagnostic logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Initialize the tracing subscriber, writing structured logs to stderr.
///
/// Stdout is left to the caller (the CLI prints results there, and in stdio
/// mode an embedding process may use it for its own protocol). The filter
/// comes from `RUST_LOG`, defaulting to `mcp_bridge=info,warn`.
pub fn init_tracing(format: LogFormat) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_bridge=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false);

    // A second call (tests, embedding hosts) keeps the first subscriber.
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        return;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        format = ?format,
        "=== mcp-bridge starting ==="
    );
}
