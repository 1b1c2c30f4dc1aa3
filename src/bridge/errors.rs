//! MCP bridge error types.

use thiserror::Error;

use super::types::{BridgeState, JsonRpcError};

/// Errors that can occur during bridge operations.
///
/// `Clone` so that one failure (shutdown, child exit) can complete every
/// pending request.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Channel unavailable, I/O failure, unreachable endpoint or non-2xx status.
    #[error("transport error: {reason}")]
    Transport {
        reason: String,
        status: Option<u16>,
    },

    /// Child process spawn or handshake failure.
    #[error("initialization failed: {reason}")]
    Initialization { reason: String },

    /// A call was issued while the bridge was not `Ready`.
    #[error("bridge is not ready (state: {state})")]
    NotReady { state: BridgeState },

    /// No response arrived within the request deadline.
    #[error("request {id} timed out after {elapsed_ms}ms")]
    RequestTimeout { id: u64, elapsed_ms: u64 },

    /// The server answered with a JSON-RPC error object.
    #[error("remote error [{code}]: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The bridge shut down or the server process went away.
    #[error("bridge closed: {reason}")]
    BridgeClosed { reason: String },

    /// Missing or invalid configuration.
    #[error("config error: {reason}")]
    Config { reason: String },
}

impl BridgeError {
    /// Transport failure without an HTTP status.
    pub(crate) fn transport(reason: impl Into<String>) -> Self {
        BridgeError::Transport {
            reason: reason.into(),
            status: None,
        }
    }

    /// HTTP status carried by a transport failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            BridgeError::Transport { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether retrying the same call might succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BridgeError::RequestTimeout { .. } | BridgeError::Transport { .. }
        )
    }
}

impl From<JsonRpcError> for BridgeError {
    fn from(e: JsonRpcError) -> Self {
        BridgeError::Remote {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}
