//! Bridge configuration loading.
//!
//! Configuration comes from a YAML file (`load_config`) or from `MCP_*`
//! environment variables (`BridgeConfig::from_env`). Either way it resolves
//! to a [`BridgeTarget`] plus [`BridgeOptions`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::client::{BridgeOptions, BridgeTarget};
use super::errors::BridgeError;
use super::process::ProcessSpec;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Which transport the bridge opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    #[default]
    Stdio,
    Http,
}

impl std::str::FromStr for TransportMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            other => Err(BridgeError::Config {
                reason: format!("unknown transport '{other}' (expected 'stdio' or 'http')"),
            }),
        }
    }
}

/// Bridge settings as written in a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub mode: TransportMode,
    /// Executable for stdio mode.
    #[serde(default = "default_command")]
    pub command: String,
    /// Server script or binary; prepended to `args` when set.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Endpoint for HTTP mode.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub client_version: Option<String>,
}

fn default_command() -> String {
    "node".into()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            command: default_command(),
            path: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            timeout_ms: default_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            client_name: None,
            client_version: None,
        }
    }
}

impl BridgeConfig {
    /// Build a config from `MCP_TRANSPORT`, `MCP_PATH`, `MCP_URL`,
    /// `MCP_COMMAND` and `MCP_TIMEOUT_MS`. Unset variables keep defaults.
    pub fn from_env() -> Result<Self, BridgeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BridgeError> {
        let mut config = Self::default();

        if let Some(mode) = lookup("MCP_TRANSPORT") {
            config.mode = mode.parse()?;
        }
        if let Some(command) = lookup("MCP_COMMAND").filter(|c| !c.is_empty()) {
            config.command = command;
        }
        config.path = lookup("MCP_PATH")
            .filter(|p| !p.is_empty())
            .map(|p| expand_tilde(&p));
        config.url = lookup("MCP_URL").filter(|u| !u.is_empty());
        if let Some(raw) = lookup("MCP_TIMEOUT_MS") {
            config.timeout_ms = raw.trim().parse().map_err(|_| BridgeError::Config {
                reason: format!("MCP_TIMEOUT_MS must be a number of milliseconds, got '{raw}'"),
            })?;
        }

        Ok(config)
    }

    /// Resolve the transport target, checking that the mode has its endpoint.
    pub fn target(&self) -> Result<BridgeTarget, BridgeError> {
        match self.mode {
            TransportMode::Http => {
                let url = self
                    .url
                    .as_deref()
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| BridgeError::Config {
                        reason: "http mode requires a url (MCP_URL)".into(),
                    })?;
                Ok(BridgeTarget::Http {
                    url: url.to_string(),
                })
            }
            TransportMode::Stdio => {
                if self.command.trim().is_empty() {
                    return Err(BridgeError::Config {
                        reason: "stdio mode requires a command or path (MCP_PATH)".into(),
                    });
                }
                let mut args = Vec::with_capacity(self.args.len() + 1);
                args.extend(self.path.iter().cloned());
                args.extend(self.args.iter().cloned());

                Ok(BridgeTarget::Stdio(ProcessSpec {
                    command: self.command.clone(),
                    args,
                    env: self.env.clone(),
                    cwd: self.cwd.clone(),
                }))
            }
        }
    }

    pub fn options(&self) -> BridgeOptions {
        let defaults = BridgeOptions::default();
        BridgeOptions {
            request_timeout: Duration::from_millis(self.timeout_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            client_name: self.client_name.clone().unwrap_or(defaults.client_name),
            client_version: self.client_version.clone().unwrap_or(defaults.client_version),
            protocol_version: defaults.protocol_version,
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load and parse a bridge config file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}`, then expands a leading `~` in `path` and `cwd`.
pub fn load_config(path: &Path) -> Result<BridgeConfig, BridgeError> {
    let raw = std::fs::read_to_string(path).map_err(|e| BridgeError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let mut config = parse_config(&raw)?;
    tracing::debug!(path = %path.display(), mode = ?config.mode, "loaded bridge config");

    config.path = config.path.as_deref().map(expand_tilde);
    config.cwd = config.cwd.as_deref().map(expand_tilde);
    Ok(config)
}

fn parse_config(raw: &str) -> Result<BridgeConfig, BridgeError> {
    let interpolated = interpolate_env_vars(raw);
    serde_yaml::from_str(&interpolated).map_err(|e| BridgeError::Config {
        reason: format!("failed to parse config: {e}"),
    })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let expr: String = chars.by_ref().take_while(|&c| c != '}').collect();
            result.push_str(&resolve_var_expr(&expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the home directory (via `dirs`, so it also
/// works where `$HOME` is unset).
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
