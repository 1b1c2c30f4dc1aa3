//! Stub servers for bridge tests.

use std::path::PathBuf;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Handler for [`serve_http`]: maps the request JSON to `(status, body)`.
pub type HttpHandler = fn(&serde_json::Value) -> (u16, String);

/// Start a minimal HTTP/1.1 server on an ephemeral port that answers every
/// POST with `handler`. Returns the endpoint URL.
pub async fn serve_http(handler: HttpHandler) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let body = read_request_body(&mut socket).await;
                let request: serde_json::Value =
                    serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
                let (status, payload) = handler(&request);
                let response = format!(
                    "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                    payload.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{addr}/rpc")
}

async fn read_request_body(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(header_end) = find_header_end(&buf) {
            let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
            let content_length = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let body_start = header_end + 4;
            if buf.len() >= body_start + content_length {
                return buf[body_start..body_start + content_length].to_vec();
            }
        }
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return Vec::new(),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// A POSIX shell script written to a temp dir, used as a stub MCP server.
pub struct StubScript {
    _dir: TempDir,
    pub path: PathBuf,
}

impl StubScript {
    pub fn new(body: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stub-server.sh");
        std::fs::write(&path, body).unwrap();
        Self { _dir: dir, path }
    }

    /// Arguments for running this script with `sh`.
    pub fn args(&self) -> Vec<String> {
        vec![self.path.to_string_lossy().into_owned()]
    }
}

/// Replies `{"ok":true}` to every request, echoing its id. Notifications get
/// no reply. Relies on the bridge writing `jsonrpc` then `id` first.
pub const ECHO_OK_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id"
  fi
done
"#;

/// Answers the handshake, then swallows every later request.
pub const SILENT_AFTER_INIT_SERVER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{"serverInfo":{"name":"silent","version":"0.0.1"}}}\n' "$id"
      ;;
  esac
done
"#;

/// Answers the handshake, then exits as soon as the next request arrives.
pub const EXIT_AFTER_INIT_SERVER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
    *'"id":'*)
      echo "fatal: crashing on request" >&2
      exit 3
      ;;
  esac
done
"#;

/// Exits immediately without reading anything.
pub const EXIT_IMMEDIATELY_SERVER: &str = "echo 'boot failure' >&2\nexit 1\n";

/// Replies to every request with a JSON-RPC error.
pub const ERROR_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
    *)
      if [ -n "$id" ]; then
        printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found","data":{"hint":"none"}}}\n' "$id"
      fi
      ;;
  esac
done
"#;

/// Answers the handshake, then closes its stdout on the next request while
/// staying alive.
pub const STDOUT_CLOSED_AFTER_INIT_SERVER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
    *'"id":'*)
      exec 1>&-
      exec sleep 30
      ;;
  esac
done
"#;

/// Answers the handshake, then closes its stdin while staying alive, so the
/// next write fails with a broken pipe.
pub const STDIN_CLOSED_AFTER_INIT_SERVER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
    *'notifications/initialized'*)
      exec 0<&-
      exec sleep 30
      ;;
  esac
done
"#;
