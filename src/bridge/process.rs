//! Child process supervision for the stdio transport.
//!
//! Spawns the MCP server with piped stdio and runs three tasks for it:
//! - a stdout reader feeding responses to the correlator,
//! - a stderr forwarder writing each line to the diagnostic log,
//! - an exit watcher that reports a closed stdout and how the process ended.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::correlator::Correlator;
use super::errors::BridgeError;
use super::transport::pump_responses;

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long the exit watcher waits for stdout to drain after the process
/// ends, so responses written just before exit still resolve.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Log target for lines the child writes to stderr.
pub const CHILD_STDERR_TARGET: &str = "mcp_bridge::child_stderr";

// ─── Types ───────────────────────────────────────────────────────────────────

/// What to run for a stdio-mode server.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
}

impl ProcessSpec {
    pub fn new(command: &str, args: Vec<String>) -> Self {
        Self {
            command: command.to_string(),
            args,
            ..Default::default()
        }
    }

    /// Name used in logs: the file name of the first argument (usually the
    /// server script), otherwise of the command.
    pub fn display_name(&self) -> String {
        let base = self.args.first().unwrap_or(&self.command);
        std::path::Path::new(base)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| base.clone())
    }
}

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` if killed by a signal or the status was unavailable.
    pub code: Option<i32>,
    /// `true` when the exit followed [`ProcessSupervisor::terminate`].
    pub requested: bool,
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// Something the supervisor observed about the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Stdout reached EOF or failed while the process was still running.
    StdoutClosed,
    /// The process ended. Always the last event.
    Exited(ProcessExit),
}

// ─── ProcessSupervisor ───────────────────────────────────────────────────────

/// Owns a running MCP server process.
pub struct ProcessSupervisor {
    server_name: String,
    /// Sends the grace period to the exit watcher.
    terminate_tx: Mutex<Option<oneshot::Sender<Duration>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    /// Spawn the server and start supervising it.
    ///
    /// Responses on stdout go to `sink`. `on_event` gets
    /// [`ProcessEvent::StdoutClosed`] if stdout ends before the process does,
    /// and exactly one [`ProcessEvent::Exited`] once the process has ended
    /// and its stdout has drained. Returns the supervisor and the child's
    /// stdin for the transport.
    pub fn spawn<F>(
        spec: &ProcessSpec,
        sink: Correlator,
        mut on_event: F,
    ) -> Result<(Self, ChildStdin), BridgeError>
    where
        F: FnMut(ProcessEvent) + Send + 'static,
    {
        let server_name = spec.display_name();

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = spec.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| BridgeError::Initialization {
            reason: format!("failed to spawn '{}': {e}", spec.command),
        })?;

        let spawn_failed = |what: &str| BridgeError::Initialization {
            reason: format!("failed to capture {what} of '{server_name}'"),
        };
        let stdin = child.stdin.take().ok_or_else(|| spawn_failed("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| spawn_failed("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| spawn_failed("stderr"))?;

        let pid = child.id();
        tracing::info!(server = %server_name, pid, command = %spec.command, "spawned MCP server");

        tokio::spawn(forward_stderr(server_name.clone(), stderr));
        let mut reader = tokio::spawn(pump_responses(server_name.clone(), stdout, sink));

        let (terminate_tx, mut terminate_rx) = oneshot::channel::<Duration>();
        let name = server_name.clone();
        let watcher = tokio::spawn(async move {
            let mut stdout_open = true;
            let (status, requested) = loop {
                tokio::select! {
                    status = child.wait() => break (status, false),
                    _ = &mut reader, if stdout_open => {
                        stdout_open = false;
                        tracing::warn!(server = %name, pid, "server stdout closed while process is running");
                        on_event(ProcessEvent::StdoutClosed);
                    }
                    grace = &mut terminate_rx => {
                        // A dropped supervisor means no grace period.
                        let grace = grace.unwrap_or(Duration::ZERO);
                        match tokio::time::timeout(grace, child.wait()).await {
                            Ok(status) => break (status, true),
                            Err(_) => {
                                tracing::warn!(server = %name, pid, "server did not exit gracefully, killing");
                                if let Err(e) = child.kill().await {
                                    tracing::debug!(server = %name, error = %e, "kill failed");
                                }
                                break (child.wait().await, true);
                            }
                        }
                    }
                }
            };

            if stdout_open && tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, reader).await.is_err() {
                tracing::debug!(server = %name, "stdout still open after exit");
            }

            let exit = ProcessExit {
                code: status.ok().and_then(|s| s.code()),
                requested,
            };
            if requested {
                tracing::info!(server = %name, pid, %exit, "server stopped");
            } else {
                tracing::warn!(server = %name, pid, %exit, "server exited unexpectedly");
            }
            on_event(ProcessEvent::Exited(exit));
        });

        Ok((
            Self {
                server_name,
                terminate_tx: Mutex::new(Some(terminate_tx)),
                watcher: Mutex::new(Some(watcher)),
            },
            stdin,
        ))
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Whether the exit watcher is still waiting on the process.
    pub fn is_running(&self) -> bool {
        self.watcher
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the process: wait up to `grace` for it to exit on its own (its
    /// stdin should already be closed), then kill it.
    ///
    /// Safe to call on an exited process and safe to call repeatedly.
    pub async fn terminate(&self, grace: Duration) {
        if let Some(tx) = self.terminate_tx.lock().take() {
            // Err means the watcher already saw the process exit.
            let _ = tx.send(grace);
        }

        let watcher = self.watcher.lock().take();
        if let Some(handle) = watcher {
            if let Err(e) = handle.await {
                tracing::warn!(server = %self.server_name, error = %e, "exit watcher failed");
            }
        }
    }
}

/// Copy the child's stderr into the log, one event per line.
async fn forward_stderr(server_name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            tracing::info!(target: CHILD_STDERR_TARGET, server = %server_name, "{line}");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
