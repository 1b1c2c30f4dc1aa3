//! JSON-RPC transports.
//!
//! Two variants behind one closed [`Transport`] enum, chosen once when the
//! bridge initializes:
//! - [`StdioTransport`]: one JSON request per line on the child's stdin;
//!   responses come back through [`pump_responses`], which the process
//!   supervisor runs over the child's stdout.
//! - [`HttpTransport`]: one POST per request; the response body is the
//!   JSON-RPC response.
//!
//! Both variants hand every response to the same [`Correlator`], so the
//! bridge completes calls the same way regardless of channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::Client as HttpClient;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::correlator::Correlator;
use super::errors::BridgeError;
use super::types::{IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, MessageKind};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout for the HTTP variant.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How much of a non-2xx body is kept in the error message.
const MAX_ERROR_BODY_CHARS: usize = 500;

// ─── Transport ───────────────────────────────────────────────────────────────

/// The channel a bridge talks over. Selected once, never switched.
pub enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

impl Transport {
    /// Send a request. The response reaches the correlator, not the caller.
    pub async fn send(&self, request: &JsonRpcRequest) -> Result<(), BridgeError> {
        match self {
            Transport::Stdio(t) => t.send(request).await,
            Transport::Http(t) => t.send(request).await,
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, notification: &JsonRpcNotification) -> Result<(), BridgeError> {
        match self {
            Transport::Stdio(t) => t.notify(notification).await,
            Transport::Http(t) => t.notify(notification).await,
        }
    }

    /// Close the channel. Later sends fail with `Transport`.
    pub async fn close(&self) {
        match self {
            Transport::Stdio(t) => t.close().await,
            Transport::Http(t) => t.close(),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Stdio(_) => "stdio",
            Transport::Http(_) => "http",
        }
    }
}

// ─── Stdio ───────────────────────────────────────────────────────────────────

type LineWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Line-delimited JSON-RPC writer over a child process's stdin.
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<Option<LineWriter>>,
}

impl StdioTransport {
    /// Wrap the write half of the child's stdio (or any async writer).
    pub fn new<W>(server_name: &str, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Some(Box::new(writer))),
        }
    }

    pub async fn send(&self, request: &JsonRpcRequest) -> Result<(), BridgeError> {
        tracing::debug!(
            server = %self.server_name,
            id = request.id,
            method = %request.method,
            "sending request"
        );
        self.write_message(request).await
    }

    pub async fn notify(&self, notification: &JsonRpcNotification) -> Result<(), BridgeError> {
        self.write_message(notification).await
    }

    /// Shut down and drop the writer; the child sees EOF on its stdin.
    pub async fn close(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(server = %self.server_name, error = %e, "stdin shutdown failed");
            }
        }
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> Result<(), BridgeError> {
        // serde_json never emits raw newlines, so one message is one line.
        let mut json = serde_json::to_string(message)
            .map_err(|e| BridgeError::transport(format!("failed to serialize message: {e}")))?;
        json.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            BridgeError::transport(format!(
                "stdio transport for '{}' is closed",
                self.server_name
            ))
        })?;

        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| BridgeError::transport(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| BridgeError::transport(format!("failed to flush stdin: {e}")))?;
        Ok(())
    }
}

/// Parse one stdout line into a response.
///
/// Returns `None` for blank lines, notifications, server-initiated requests
/// and malformed input; each non-blank case is logged.
pub fn parse_line(server_name: &str, line: &str) -> Option<JsonRpcResponse> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let message: IncomingMessage = match serde_json::from_str(trimmed) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(
                server = %server_name,
                error = %e,
                line = %truncate(trimmed, 200),
                "dropping malformed line from server"
            );
            return None;
        }
    };

    match message.kind() {
        Some(MessageKind::Response(resp)) => Some(resp),
        Some(MessageKind::Notification { method }) => {
            tracing::debug!(server = %server_name, method = %method, "server notification");
            None
        }
        Some(MessageKind::ServerRequest { id, method }) => {
            tracing::warn!(
                server = %server_name,
                id,
                method = %method,
                "ignoring unsupported server-initiated request"
            );
            None
        }
        None => {
            tracing::warn!(
                server = %server_name,
                line = %truncate(trimmed, 200),
                "dropping message with neither id nor method"
            );
            None
        }
    }
}

/// Read newline-delimited responses until EOF and hand each to `sink`.
///
/// Malformed lines are dropped without touching any pending request.
pub async fn pump_responses<R>(server_name: String, reader: R, sink: Correlator)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(resp) = parse_line(&server_name, &line) {
                    sink.deliver(resp);
                }
            }
            Ok(None) => {
                tracing::info!(server = %server_name, "server stdout closed (EOF)");
                break;
            }
            Err(e) => {
                tracing::error!(server = %server_name, error = %e, "error reading server stdout");
                break;
            }
        }
    }
}

// ─── HTTP ────────────────────────────────────────────────────────────────────

/// JSON-RPC over HTTP POST to a single endpoint.
pub struct HttpTransport {
    url: String,
    http: HttpClient,
    sink: Correlator,
    open: AtomicBool,
}

impl HttpTransport {
    /// Build an HTTP transport. `request_timeout` bounds each POST.
    pub fn new(url: &str, request_timeout: Duration, sink: Correlator) -> Result<Self, BridgeError> {
        if url.trim().is_empty() {
            return Err(BridgeError::transport("no endpoint URL configured"));
        }

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| BridgeError::transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.to_string(),
            http,
            sink,
            open: AtomicBool::new(true),
        })
    }

    /// POST the request and deliver the decoded response to the correlator.
    ///
    /// A non-2xx status fails with `Transport { status }` before the body is
    /// interpreted.
    pub async fn send(&self, request: &JsonRpcRequest) -> Result<(), BridgeError> {
        let resp = self.post(request).await?;

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| BridgeError::transport(format!("failed to read response body: {e}")))?;

        let decoded: JsonRpcResponse = serde_json::from_slice(&bytes).map_err(|e| {
            BridgeError::transport(format!("response body is not a JSON-RPC response: {e}"))
        })?;

        if decoded.id != request.id {
            return Err(BridgeError::transport(format!(
                "response id {} does not match request id {}",
                decoded.id, request.id
            )));
        }

        self.sink.deliver(decoded);
        Ok(())
    }

    /// POST a notification; only the status is checked.
    pub async fn notify(&self, notification: &JsonRpcNotification) -> Result<(), BridgeError> {
        self.post(notification).await.map(|_| ())
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    async fn post<T: Serialize>(&self, body: &T) -> Result<reqwest::Response, BridgeError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BridgeError::transport(format!(
                "http transport for {} is closed",
                self.url
            )));
        }

        let resp = self
            .http
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| BridgeError::Transport {
                reason: format!("request to {} failed: {e}", self.url),
                status: e.status().map(|s| s.as_u16()),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(url = %self.url, status = status.as_u16(), "endpoint returned error status");
            return Err(BridgeError::Transport {
                reason: format!("HTTP {}: {}", status.as_u16(), truncate(&body, MAX_ERROR_BODY_CHARS)),
                status: Some(status.as_u16()),
            });
        }

        Ok(resp)
    }
}

/// Truncate to at most `max` chars on a char boundary.
fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
