//! McpBridge: the public request/response API over one MCP server.
//!
//! Owns one [`Correlator`], one [`Transport`] and, in stdio mode, one
//! [`ProcessSupervisor`]. Lifecycle:
//!
//! ```text
//! Uninitialized ──initialize ok──▶ Ready ──shutdown──▶ ShuttingDown ──▶ Closed
//!       │                            │
//!       └──initialize failed──▶ Closed ◀──channel lost──┘
//! ```
//!
//! The channel counts as lost when the child exits, closes its stdout, or
//! stops accepting writes on its stdin. Every transition into `Closed`
//! rejects whatever is still pending and refuses later registrations, so no
//! caller is left waiting.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::correlator::{Correlator, DEFAULT_REQUEST_TIMEOUT};
use super::errors::BridgeError;
use super::process::{ProcessEvent, ProcessSpec, ProcessSupervisor};
use super::transport::{HttpTransport, StdioTransport, Transport};
use super::types::{
    BridgeState, ClientInfo, InitializeParams, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, ListToolsResult, ServerInfo, ToolDescriptor, DEFAULT_PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Time the child gets to exit after its stdin closes before it is killed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ─── Options & Target ────────────────────────────────────────────────────────

/// Tunables fixed for the lifetime of a bridge.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Deadline applied uniformly to every call, including the handshake.
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Which channel to open, and where.
#[derive(Debug, Clone)]
pub enum BridgeTarget {
    /// Spawn a child process and speak line-delimited JSON-RPC over its stdio.
    Stdio(ProcessSpec),
    /// POST each request to this endpoint.
    Http { url: String },
}

// ─── Shared State ────────────────────────────────────────────────────────────

/// State reachable from the child-exit callback as well as from the bridge.
struct Shared {
    state: Mutex<BridgeState>,
    correlator: Correlator,
    transport: Mutex<Option<Arc<Transport>>>,
    supervisor: Mutex<Option<Arc<ProcessSupervisor>>>,
    server: Mutex<Option<InitializeResult>>,
}

impl Shared {
    /// Failure path for a lost channel: reject everything, go to `Closed`,
    /// and release the transport and process in the background.
    fn fail(&self, reason: String) {
        {
            let mut state = self.state.lock();
            if !matches!(*state, BridgeState::Initializing | BridgeState::Ready) {
                return;
            }
            *state = BridgeState::Closed;
        }

        tracing::error!(reason = %reason, "bridge channel lost, closing");
        self.correlator.close(BridgeError::BridgeClosed { reason });

        let transport = self.transport.lock().take();
        let supervisor = self.supervisor.lock().take();
        tokio::spawn(async move {
            if let Some(t) = transport {
                t.close().await;
            }
            if let Some(s) = supervisor {
                s.terminate(Duration::ZERO).await;
            }
        });
    }
}

// ─── McpBridge ───────────────────────────────────────────────────────────────

/// Request/response bridge to a single MCP server.
///
/// Share it behind an `Arc`; every operation takes `&self` and calls may run
/// concurrently.
pub struct McpBridge {
    shared: Arc<Shared>,
    options: BridgeOptions,
}

impl McpBridge {
    /// Create an uninitialized bridge.
    pub fn new(options: BridgeOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BridgeState::Uninitialized),
                correlator: Correlator::new(options.request_timeout),
                transport: Mutex::new(None),
                supervisor: Mutex::new(None),
                server: Mutex::new(None),
            }),
            options,
        }
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn state(&self) -> BridgeState {
        *self.shared.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == BridgeState::Ready
    }

    /// Number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    /// `"stdio"` or `"http"` once a transport is open.
    pub fn transport_kind(&self) -> Option<&'static str> {
        self.shared.transport.lock().as_ref().map(|t| t.kind())
    }

    /// Server identity reported in the handshake (stdio mode only).
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared
            .server
            .lock()
            .as_ref()
            .and_then(|r| r.server_info.clone())
    }

    /// Capabilities reported in the handshake (stdio mode only).
    pub fn server_capabilities(&self) -> Option<serde_json::Value> {
        self.shared.server.lock().as_ref().map(|r| r.capabilities.clone())
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Open the transport and, in stdio mode, perform the handshake.
    ///
    /// Allowed once, from `Uninitialized`. On failure every partially started
    /// resource is released and the bridge ends up `Closed`.
    pub async fn initialize(&self, target: BridgeTarget) -> Result<(), BridgeError> {
        {
            let mut state = self.shared.state.lock();
            if *state != BridgeState::Uninitialized {
                return Err(BridgeError::Initialization {
                    reason: format!("cannot initialize a bridge that is {}", *state),
                });
            }
            *state = BridgeState::Initializing;
        }

        let started = Instant::now();
        let outcome = self.start(target).await;

        let failure = match outcome {
            Ok(()) => {
                let mut state = self.shared.state.lock();
                if *state == BridgeState::Initializing {
                    *state = BridgeState::Ready;
                    tracing::info!(
                        transport = self.transport_kind().unwrap_or("none"),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "MCP bridge ready"
                    );
                    return Ok(());
                }
                BridgeError::Initialization {
                    reason: format!("bridge became {} during initialization", *state),
                }
            }
            Err(BridgeError::Initialization { reason }) => BridgeError::Initialization { reason },
            Err(e) => BridgeError::Initialization {
                reason: format!("handshake failed: {e}"),
            },
        };

        tracing::error!(error = %failure, "MCP bridge initialization failed");
        self.shared.correlator.close(BridgeError::BridgeClosed {
            reason: "initialization failed".into(),
        });
        self.teardown().await;
        *self.shared.state.lock() = BridgeState::Closed;
        Err(failure)
    }

    /// Reject every pending call, close the transport, stop the child.
    ///
    /// Idempotent: a no-op once shutting down or closed.
    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            match *state {
                BridgeState::ShuttingDown | BridgeState::Closed => return,
                _ => *state = BridgeState::ShuttingDown,
            }
        }

        tracing::info!(pending = self.pending_count(), "shutting down MCP bridge");
        self.shared.correlator.close(BridgeError::BridgeClosed {
            reason: "bridge shut down".into(),
        });
        self.teardown().await;
        *self.shared.state.lock() = BridgeState::Closed;
        tracing::info!("MCP bridge closed");
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Call `method` and wait for its result.
    ///
    /// Fails with `NotReady` outside `Ready`; timeouts, transport failures
    /// and remote errors are returned unchanged.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, BridgeError> {
        let state = self.state();
        if state != BridgeState::Ready {
            return Err(BridgeError::NotReady { state });
        }

        let start = Instant::now();
        let result = self.request(method, params).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::debug!(method, elapsed_ms, "call completed"),
            Err(e) => tracing::debug!(method, elapsed_ms, error = %e, "call failed"),
        }
        result
    }

    /// Invoke a server tool via `tools/call`. Failures are logged and returned.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });

        self.call("tools/call", Some(params)).await.map_err(|e| {
            tracing::error!(tool = name, error = %e, "tool call failed");
            e
        })
    }

    /// List the server's tools via `tools/list`.
    ///
    /// Tool discovery is advisory: any failure is logged and yields an empty
    /// list.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let value = match self.call("tools/list", None).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "tools/list failed, returning no tools");
                return Vec::new();
            }
        };

        match serde_json::from_value::<ListToolsResult>(value) {
            Ok(list) => list.tools,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable tools/list result, returning no tools");
                Vec::new()
            }
        }
    }

    // ─── Internals ───────────────────────────────────────────────────────

    async fn start(&self, target: BridgeTarget) -> Result<(), BridgeError> {
        match target {
            BridgeTarget::Http { url } => {
                let transport = HttpTransport::new(
                    &url,
                    self.options.request_timeout,
                    self.shared.correlator.clone(),
                )
                .map_err(|e| BridgeError::Initialization {
                    reason: e.to_string(),
                })?;
                tracing::info!(url = %url, "using HTTP transport");
                *self.shared.transport.lock() = Some(Arc::new(Transport::Http(transport)));
                Ok(())
            }
            BridgeTarget::Stdio(spec) => {
                let weak: Weak<Shared> = Arc::downgrade(&self.shared);
                let (supervisor, stdin) =
                    ProcessSupervisor::spawn(&spec, self.shared.correlator.clone(), move |event| {
                        let reason = match event {
                            ProcessEvent::StdoutClosed => "server stdout closed".to_string(),
                            ProcessEvent::Exited(exit) if !exit.requested => {
                                format!("server process exited ({exit})")
                            }
                            ProcessEvent::Exited(_) => return,
                        };
                        if let Some(shared) = weak.upgrade() {
                            shared.fail(reason);
                        }
                    })?;

                let transport = StdioTransport::new(supervisor.server_name(), stdin);
                *self.shared.supervisor.lock() = Some(Arc::new(supervisor));
                *self.shared.transport.lock() = Some(Arc::new(Transport::Stdio(transport)));

                self.handshake().await
            }
        }
    }

    /// `initialize` request followed by the `notifications/initialized`
    /// notification.
    async fn handshake(&self) -> Result<(), BridgeError> {
        let params = InitializeParams {
            protocol_version: self.options.protocol_version.clone(),
            capabilities: serde_json::json!({}),
            client_info: ClientInfo {
                name: self.options.client_name.clone(),
                version: self.options.client_version.clone(),
            },
        };
        let params = serde_json::to_value(params).map_err(|e| BridgeError::Initialization {
            reason: format!("failed to encode initialize params: {e}"),
        })?;

        let result = self.request("initialize", Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(result).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "unrecognized initialize result, ignoring server info");
            InitializeResult::default()
        });

        if let Some(info) = &init.server_info {
            tracing::info!(
                server = info.name.as_deref().unwrap_or("unknown"),
                version = info.version.as_deref().unwrap_or("unknown"),
                protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
                "MCP handshake complete"
            );
        }
        *self.shared.server.lock() = Some(init);

        self.current_transport()?
            .notify(&JsonRpcNotification::new("notifications/initialized", None))
            .await
    }

    /// Register, send, and wait. No state check: the handshake runs before
    /// `Ready`.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, BridgeError> {
        let transport = self.current_transport()?;
        let correlator = &self.shared.correlator;

        let id = correlator.next_id();
        let pending = correlator.register(id);
        if correlator.is_closed() {
            // Closed between the caller's state check and registration.
            return pending.wait().await;
        }
        let request = JsonRpcRequest::new(id, method, params);

        if let Err(e) = transport.send(&request).await {
            tracing::warn!(id, method, error = %e, "failed to send request");
            correlator.reject(id, e.clone());
            // A failed stdin write means the pipe is gone; HTTP failures are
            // per request.
            if matches!(*transport, Transport::Stdio(_)) {
                self.shared.fail(format!("failed to write to server stdin: {e}"));
            }
        }

        pending.wait().await
    }

    fn current_transport(&self) -> Result<Arc<Transport>, BridgeError> {
        self.shared
            .transport
            .lock()
            .clone()
            .ok_or_else(|| BridgeError::BridgeClosed {
                reason: "transport is closed".into(),
            })
    }

    /// Close the transport, then stop the child. Safe to repeat.
    async fn teardown(&self) {
        let transport = self.shared.transport.lock().take();
        if let Some(t) = transport {
            t.close().await;
        }

        let supervisor = self.shared.supervisor.lock().take();
        if let Some(s) = supervisor {
            s.terminate(self.options.shutdown_grace).await;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::test_support::serve_http;

    fn fast_options() -> BridgeOptions {
        BridgeOptions {
            request_timeout: Duration::from_millis(300),
            shutdown_grace: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_options() {
        let options = BridgeOptions::default();
        assert_eq!(options.request_timeout, Duration::from_secs(30));
        assert_eq!(options.protocol_version, DEFAULT_PROTOCOL_VERSION);
        assert_eq!(options.client_name, "mcp-bridge");
    }

    #[tokio::test]
    async fn test_call_before_initialize_is_not_ready() {
        let bridge = McpBridge::new(fast_options());
        let err = bridge.call("tools/list", None).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::NotReady {
                state: BridgeState::Uninitialized
            }
        ));
        assert!(bridge.list_tools().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let bridge = McpBridge::new(fast_options());
        bridge.shutdown().await;
        assert_eq!(bridge.state(), BridgeState::Closed);
        bridge.shutdown().await;
        assert_eq!(bridge.state(), BridgeState::Closed);

        let err = bridge.call("tools/list", None).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::NotReady {
                state: BridgeState::Closed
            }
        ));

        // Closed is terminal.
        let err = bridge
            .initialize(BridgeTarget::Http {
                url: "http://127.0.0.1:9/rpc".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Initialization { .. }));
    }

    // ─── HTTP ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_http_ready_without_handshake() {
        let url = serve_http(|req| {
            let id = req["id"].as_u64().unwrap_or(0);
            let method = req["method"].as_str().unwrap_or_default().to_string();
            (
                200,
                serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {"method": method, "id": id}})
                    .to_string(),
            )
        })
        .await;

        let bridge = McpBridge::new(fast_options());
        bridge.initialize(BridgeTarget::Http { url }).await.unwrap();
        assert!(bridge.is_ready());
        assert_eq!(bridge.transport_kind(), Some("http"));
        assert!(bridge.server_info().is_none());

        let result = bridge
            .call_tool("get_tax_obligations", serde_json::json!({"year": 2024}))
            .await
            .unwrap();
        assert_eq!(result["method"], "tools/call");

        // IDs are strictly increasing across calls.
        let mut last = result["id"].as_u64().unwrap();
        for _ in 0..10 {
            let r = bridge.call("ping", None).await.unwrap();
            let id = r["id"].as_u64().unwrap();
            assert!(id > last);
            last = id;
        }

        bridge.shutdown().await;
        assert_eq!(bridge.state(), BridgeState::Closed);
    }

    #[tokio::test]
    async fn test_http_500_fails_with_status() {
        let url = serve_http(|_| (500, "this is not json".to_string())).await;
        let bridge = McpBridge::new(fast_options());
        bridge.initialize(BridgeTarget::Http { url }).await.unwrap();

        let err = bridge.call("tools/list", None).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Transport {
                status: Some(500),
                ..
            }
        ));
        assert_eq!(bridge.pending_count(), 0);
        // Transport failures do not close the bridge.
        assert!(bridge.is_ready());
    }

    #[tokio::test]
    async fn test_http_remote_error_passes_through() {
        let url = serve_http(|req| {
            let id = req["id"].as_u64().unwrap_or(0);
            (
                200,
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32602, "message": "year required", "data": {"param": "year"}}
                })
                .to_string(),
            )
        })
        .await;
        let bridge = McpBridge::new(fast_options());
        bridge.initialize(BridgeTarget::Http { url }).await.unwrap();

        let err = bridge
            .call_tool("get_tax_obligations", serde_json::json!({}))
            .await
            .unwrap_err();
        match err {
            BridgeError::Remote {
                code,
                message,
                data,
            } => {
                assert_eq!(code, -32602);
                assert_eq!(message, "year required");
                assert_eq!(data.unwrap()["param"], "year");
            }
            other => panic!("expected Remote, got {other:?}"),
        }

        // Discovery soft-fails on the same error.
        assert!(bridge.list_tools().await.is_empty());
    }

    #[tokio::test]
    async fn test_http_list_tools() {
        let url = serve_http(|req| {
            let id = req["id"].as_u64().unwrap_or(0);
            (
                200,
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"tools": [
                        {"name": "get_tax_obligations", "description": "List all taxes the user is liable for",
                         "inputSchema": {"type": "object", "properties": {"year": {"type": "number"}}}},
                        {"name": "get_upcoming_dues"}
                    ]}
                })
                .to_string(),
            )
        })
        .await;
        let bridge = McpBridge::new(fast_options());
        bridge.initialize(BridgeTarget::Http { url }).await.unwrap();

        let tools = bridge.list_tools().await;
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "get_tax_obligations");
        assert_eq!(tools[0].input_schema["type"], "object");
        assert!(tools[1].description.is_none());
    }

    #[tokio::test]
    async fn test_http_unreachable_is_transport_error() {
        let bridge = McpBridge::new(fast_options());
        bridge
            .initialize(BridgeTarget::Http {
                url: "http://127.0.0.1:9/rpc".into(),
            })
            .await
            .unwrap();

        let err = bridge.call("tools/list", None).await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_http_empty_url_fails_initialization() {
        let bridge = McpBridge::new(fast_options());
        let err = bridge
            .initialize(BridgeTarget::Http { url: String::new() })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Initialization { .. }));
        assert_eq!(bridge.state(), BridgeState::Closed);
    }

    // ─── Stdio ───────────────────────────────────────────────────────────

    #[cfg(unix)]
    mod stdio {
        use super::*;
        use crate::bridge::test_support::{
            StubScript, ECHO_OK_SERVER, ERROR_SERVER, EXIT_AFTER_INIT_SERVER,
            EXIT_IMMEDIATELY_SERVER, SILENT_AFTER_INIT_SERVER, STDIN_CLOSED_AFTER_INIT_SERVER,
            STDOUT_CLOSED_AFTER_INIT_SERVER,
        };

        fn target(script: &StubScript) -> BridgeTarget {
            BridgeTarget::Stdio(ProcessSpec::new("sh", script.args()))
        }

        async fn ready_bridge(script: &StubScript, options: BridgeOptions) -> McpBridge {
            let bridge = McpBridge::new(options);
            bridge.initialize(target(script)).await.unwrap();
            assert!(bridge.is_ready());
            bridge
        }

        #[tokio::test]
        async fn test_call_tool_over_stdio() {
            let script = StubScript::new(ECHO_OK_SERVER);
            let bridge = ready_bridge(&script, fast_options()).await;
            assert_eq!(bridge.transport_kind(), Some("stdio"));

            let result = bridge
                .call_tool("get_tax_obligations", serde_json::json!({"year": 2024}))
                .await
                .unwrap();
            assert_eq!(result, serde_json::json!({"ok": true}));

            bridge.shutdown().await;
            assert_eq!(bridge.state(), BridgeState::Closed);
        }

        #[tokio::test]
        async fn test_concurrent_calls_each_resolve_once() {
            let script = StubScript::new(ECHO_OK_SERVER);
            let options = BridgeOptions {
                request_timeout: Duration::from_secs(10),
                ..fast_options()
            };
            let bridge = Arc::new(ready_bridge(&script, options).await);

            let calls = (0..50).map(|n| {
                let bridge = bridge.clone();
                async move {
                    bridge
                        .call_tool("get_upcoming_dues", serde_json::json!({"days_ahead": n}))
                        .await
                }
            });
            let results = futures::future::join_all(calls).await;

            assert_eq!(results.len(), 50);
            assert!(results.iter().all(|r| r.as_ref().unwrap()["ok"] == true));
            assert_eq!(bridge.pending_count(), 0);

            bridge.shutdown().await;
        }

        #[tokio::test]
        async fn test_silent_server_times_out_with_id() {
            let script = StubScript::new(SILENT_AFTER_INIT_SERVER);
            let bridge = ready_bridge(&script, fast_options()).await;
            assert_eq!(bridge.server_info().unwrap().name.as_deref(), Some("silent"));

            let err = bridge.call("tools/call", None).await.unwrap_err();
            match err {
                BridgeError::RequestTimeout { id, elapsed_ms } => {
                    // The handshake used id 1.
                    assert_eq!(id, 2);
                    assert!(elapsed_ms >= 300);
                }
                other => panic!("expected RequestTimeout, got {other:?}"),
            }
            assert_eq!(bridge.pending_count(), 0);
            // A timeout is per-request; the bridge stays usable.
            assert!(bridge.is_ready());

            bridge.shutdown().await;
        }

        #[tokio::test]
        async fn test_shutdown_rejects_in_flight_calls() {
            let script = StubScript::new(SILENT_AFTER_INIT_SERVER);
            let options = BridgeOptions {
                request_timeout: Duration::from_secs(30),
                ..fast_options()
            };
            let bridge = Arc::new(ready_bridge(&script, options).await);

            let in_flight = {
                let bridge = bridge.clone();
                tokio::spawn(async move { bridge.call("tools/list", None).await })
            };
            while bridge.pending_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            bridge.shutdown().await;
            let err = in_flight.await.unwrap().unwrap_err();
            assert!(matches!(err, BridgeError::BridgeClosed { .. }));

            bridge.shutdown().await;
            assert!(matches!(
                bridge.call("tools/list", None).await,
                Err(BridgeError::NotReady {
                    state: BridgeState::Closed
                })
            ));
        }

        #[tokio::test]
        async fn test_child_exit_fails_in_flight_call() {
            let script = StubScript::new(EXIT_AFTER_INIT_SERVER);
            let options = BridgeOptions {
                request_timeout: Duration::from_secs(30),
                ..fast_options()
            };
            let bridge = ready_bridge(&script, options).await;

            let err = bridge
                .call_tool("get_spending_advice", serde_json::json!({"focus": "tax"}))
                .await
                .unwrap_err();
            assert!(matches!(err, BridgeError::BridgeClosed { .. }));
            assert_eq!(bridge.state(), BridgeState::Closed);

            let err = bridge.call("tools/list", None).await.unwrap_err();
            assert!(matches!(
                err,
                BridgeError::NotReady {
                    state: BridgeState::Closed
                }
            ));

            // Still safe after the implicit close.
            bridge.shutdown().await;
        }

        #[tokio::test]
        async fn test_stdout_closed_by_live_child_closes_bridge() {
            let script = StubScript::new(STDOUT_CLOSED_AFTER_INIT_SERVER);
            let options = BridgeOptions {
                request_timeout: Duration::from_secs(30),
                ..fast_options()
            };
            let bridge = ready_bridge(&script, options).await;

            let started = Instant::now();
            let err = tokio::time::timeout(
                Duration::from_secs(5),
                bridge.call_tool("get_tax_obligations", serde_json::json!({"year": 2024})),
            )
            .await
            .expect("call must fail promptly, not wait out its timeout")
            .unwrap_err();
            assert!(matches!(err, BridgeError::BridgeClosed { .. }));
            assert!(started.elapsed() < Duration::from_secs(5));
            assert_eq!(bridge.state(), BridgeState::Closed);
            assert_eq!(bridge.pending_count(), 0);

            assert!(matches!(
                bridge.call("tools/list", None).await,
                Err(BridgeError::NotReady {
                    state: BridgeState::Closed
                })
            ));
            bridge.shutdown().await;
        }

        #[tokio::test]
        async fn test_broken_stdin_closes_bridge() {
            let script = StubScript::new(STDIN_CLOSED_AFTER_INIT_SERVER);
            let options = BridgeOptions {
                request_timeout: Duration::from_secs(30),
                ..fast_options()
            };
            let bridge = ready_bridge(&script, options).await;
            // Let the child close its end of the pipe.
            tokio::time::sleep(Duration::from_millis(300)).await;

            let err = tokio::time::timeout(Duration::from_secs(5), bridge.call("tools/list", None))
                .await
                .expect("call must fail promptly")
                .unwrap_err();
            assert!(matches!(err, BridgeError::Transport { .. }));
            assert_eq!(bridge.state(), BridgeState::Closed);
            assert_eq!(bridge.pending_count(), 0);

            assert!(matches!(
                bridge.call("tools/list", None).await,
                Err(BridgeError::NotReady {
                    state: BridgeState::Closed
                })
            ));
            bridge.shutdown().await;
        }

        #[tokio::test]
        async fn test_child_exiting_at_startup_fails_initialize() {
            let script = StubScript::new(EXIT_IMMEDIATELY_SERVER);
            let bridge = McpBridge::new(fast_options());

            let err = bridge.initialize(target(&script)).await.unwrap_err();
            assert!(matches!(err, BridgeError::Initialization { .. }));
            assert_eq!(bridge.state(), BridgeState::Closed);
            assert_eq!(bridge.pending_count(), 0);
            assert!(bridge.transport_kind().is_none());

            assert!(matches!(
                bridge.call("tools/list", None).await,
                Err(BridgeError::NotReady { .. })
            ));
        }

        #[tokio::test]
        async fn test_spawn_failure_fails_initialize() {
            let bridge = McpBridge::new(fast_options());
            let err = bridge
                .initialize(BridgeTarget::Stdio(ProcessSpec::new(
                    "/no/such/mcp-server",
                    vec![],
                )))
                .await
                .unwrap_err();
            assert!(err.to_string().contains("failed to spawn"));
            assert_eq!(bridge.state(), BridgeState::Closed);
        }

        #[tokio::test]
        async fn test_remote_errors_over_stdio() {
            let script = StubScript::new(ERROR_SERVER);
            let bridge = ready_bridge(&script, fast_options()).await;

            let err = bridge
                .call_tool("search_dutch_tax_law", serde_json::json!({"query": "box 3"}))
                .await
                .unwrap_err();
            match err {
                BridgeError::Remote { code, data, .. } => {
                    assert_eq!(code, -32601);
                    assert_eq!(data.unwrap()["hint"], "none");
                }
                other => panic!("expected Remote, got {other:?}"),
            }
            assert!(bridge.list_tools().await.is_empty());
            assert!(bridge.is_ready());

            bridge.shutdown().await;
        }

        #[tokio::test]
        async fn test_second_initialize_is_rejected() {
            let script = StubScript::new(ECHO_OK_SERVER);
            let bridge = ready_bridge(&script, fast_options()).await;

            let err = bridge.initialize(target(&script)).await.unwrap_err();
            assert!(matches!(err, BridgeError::Initialization { .. }));
            assert!(bridge.is_ready());

            bridge.shutdown().await;
        }
    }
}
