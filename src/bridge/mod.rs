//! MCP Bridge: JSON-RPC 2.0 to a single MCP server over child-process stdio
//! or HTTP.
//!
//! This module handles:
//! - Spawning and supervising the server process (stdio mode)
//! - Line-delimited JSON-RPC framing, or one POST per request (HTTP mode)
//! - Correlating responses to requests by id, with per-request timeouts
//! - The MCP handshake and the `tools/list` / `tools/call` surface
//! - Shutdown that leaves no caller waiting

pub mod client;
pub mod config;
pub mod correlator;
pub mod errors;
pub mod process;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use client::{BridgeOptions, BridgeTarget, McpBridge};
pub use config::{load_config, BridgeConfig, TransportMode};
pub use errors::BridgeError;
pub use process::ProcessSpec;
pub use types::{BridgeState, ServerInfo, ToolDescriptor};
