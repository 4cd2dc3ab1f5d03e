//! Session configuration and the servers config file.
//!
//! A [`SessionConfig`] is everything needed to spawn one server. Configs are
//! usually built in code, or loaded in bulk from a `mcp-servers.json` (or
//! `.yaml`) file whose string values may reference `${VAR}` /
//! `${VAR:-default}` environment variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::correlator::DEFAULT_REQUEST_TIMEOUT;
use super::errors::McpError;

/// Environment variable naming the servers config file.
pub const SERVERS_CONFIG_ENV: &str = "TOOLWIRE_SERVERS_CONFIG";

/// Servers config file used when nothing else is specified.
pub const DEFAULT_SERVERS_CONFIG: &str = "./mcp-servers.json";

// ─── SessionConfig ───────────────────────────────────────────────────────────

/// How to spawn and talk to one server. Immutable once handed to a session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionConfig {
    /// Registry key; unique within a manager.
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overlaid on top of the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the process (defaults to the caller's).
    #[serde(default)]
    pub cwd: Option<String>,
    /// Per-request timeout; `None` means [`DEFAULT_REQUEST_TIMEOUT`].
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
}

impl SessionConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            timeout_ms: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Effective per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }
}

// ─── Servers file ────────────────────────────────────────────────────────────

/// One entry of the servers file; the name comes from the map key.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
    /// Entries can be kept in the file but switched off.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServerEntry {
    fn interpolate_env_vars(&mut self) {
        self.command = interpolate_env_vars(&self.command);
        for arg in &mut self.args {
            *arg = interpolate_env_vars(arg);
        }
        for value in self.env.values_mut() {
            *value = interpolate_env_vars(value);
        }
        if let Some(cwd) = &mut self.cwd {
            *cwd = interpolate_env_vars(cwd);
        }
    }
}

/// Top-level servers configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServersConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerEntry>,
}

impl ServersConfig {
    /// Parse a servers file. YAML for `.yaml`/`.yml`, JSON otherwise.
    ///
    /// `${VAR}` references are expanded in the parsed string values, never in
    /// the raw file, so values containing quotes or backslashes stay intact.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );
        let mut config: ServersConfig = if is_yaml {
            serde_yaml::from_str(&raw).map_err(|e| McpError::ConfigError {
                reason: format!("failed to parse {}: {e}", path.display()),
            })?
        } else {
            serde_json::from_str(&raw).map_err(|e| McpError::ConfigError {
                reason: format!("failed to parse {}: {e}", path.display()),
            })?
        };

        for entry in config.servers.values_mut() {
            entry.interpolate_env_vars();
        }

        tracing::info!(
            path = %path.display(),
            count = config.servers.len(),
            "loaded servers config"
        );
        Ok(config)
    }

    /// Enabled entries as session configs, sorted by name.
    pub fn into_session_configs(self) -> Vec<SessionConfig> {
        let mut configs: Vec<SessionConfig> = self
            .servers
            .into_iter()
            .filter(|(name, entry)| {
                if !entry.enabled {
                    tracing::debug!(server = %name, "server disabled in config, skipping");
                }
                entry.enabled
            })
            .map(|(name, entry)| SessionConfig {
                name,
                command: entry.command,
                args: entry.args,
                env: entry.env,
                cwd: entry.cwd,
                timeout_ms: entry.timeout_ms,
            })
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }
}

/// Pick the servers file: explicit path, then `TOOLWIRE_SERVERS_CONFIG`, then
/// `./mcp-servers.json`.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var(SERVERS_CONFIG_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_SERVERS_CONFIG),
    }
}

// ─── Env interpolation ──────────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` with environment values.
///
/// Unset variables without a default become empty strings.
pub fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
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

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
