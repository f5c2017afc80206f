//! Configuration parsing and validation.
//!
//! Precedence: built-in defaults, then the YAML config file, then
//! environment variables, then CLI flags (clap's `env` attribute folds the
//! last two together).

use crate::error::{BridgeError, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-bridge")]
#[command(
    version,
    about = "Expose stdio-based MCP servers over the Streamable HTTP transport"
)]
pub struct CliArgs {
    /// Path to the YAML config file.
    #[arg(short = 'c', long = "config", env = "BRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// HTTP bind address (ip:port).
    #[arg(short = 'b', long, env = "BRIDGE_BIND")]
    pub bind: Option<String>,

    /// Log level. Supports tracing filter syntax.
    #[arg(short = 'l', long = "log-level", env = "BRIDGE_LOG")]
    pub log_level: Option<String>,

    /// Print the fully resolved configuration and exit.
    #[arg(long = "print-effective-config")]
    pub print_effective_config: bool,
}

// ============================================================================
// Defaults
// ============================================================================

const DEFAULT_BIND: &str = "127.0.0.1:3000";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_SESSION_TIMEOUT_MS: u64 = 3_600_000;
const DEFAULT_BATCH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_SESSIONS: usize = 100;
const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 3;
const DEFAULT_RESTART_DELAY_MS: u64 = 1_000;
const DEFAULT_SPAWN_WAIT_MS: u64 = 500;
const DEFAULT_SSE_KEEP_ALIVE_SECS: u64 = 30;

// ============================================================================
// Effective settings
// ============================================================================

/// Effective bridge settings (after merging defaults + config + env + CLI).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSettings {
    pub bind: String,
    pub log_level: String,
    pub session_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub batch_timeout_ms: u64,
    pub max_sessions: usize,
    pub max_restart_attempts: u32,
    pub restart_delay_ms: u64,
    pub spawn_wait_ms: u64,
    pub sse_keep_alive_secs: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            request_timeout_ms: crate::timeouts::request_timeout_default_ms(),
            batch_timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_restart_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
            spawn_wait_ms: DEFAULT_SPAWN_WAIT_MS,
            sse_keep_alive_secs: DEFAULT_SSE_KEEP_ALIVE_SECS,
        }
    }
}

impl BridgeSettings {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn spawn_wait(&self) -> Duration {
        Duration::from_millis(self.spawn_wait_ms)
    }

    pub fn sse_keep_alive(&self) -> Duration {
        Duration::from_secs(self.sse_keep_alive_secs)
    }
}

/// Bridge settings as provided by the config file (partial; all optional).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSection {
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub session_timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub batch_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_sessions: Option<usize>,
    #[serde(default)]
    pub max_restart_attempts: Option<u32>,
    #[serde(default)]
    pub restart_delay_ms: Option<u64>,
    #[serde(default)]
    pub spawn_wait_ms: Option<u64>,
    #[serde(default)]
    pub sse_keep_alive_secs: Option<u64>,
}

// ============================================================================
// CORS / Auth
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsConfig {
    /// Exact origins, or `*` to permit any.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl CorsConfig {
    pub fn allows(&self, origin: &str) -> bool {
        self.allowed_origins
            .iter()
            .any(|o| o == "*" || o == origin)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Bearer token allow-list. Ignored unless `enabled`.
    #[serde(default)]
    pub tokens: Vec<String>,
}

// ============================================================================
// MCP Server Config (stdio)
// ============================================================================

/// Static description of one stdio MCP server.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Command to execute. No shell interpretation.
    pub command: String,

    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overlay for the process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Optional working directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// HTTP endpoint path. Defaults to `/<name>`.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl ServerConfig {
    pub fn endpoint_for(&self, name: &str) -> String {
        self.endpoint.clone().unwrap_or_else(|| format!("/{name}"))
    }
}

// ============================================================================
// Config file
// ============================================================================

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub cors: Option<CorsConfig>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

// ============================================================================
// Merged configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub cli: CliArgs,
    pub settings: BridgeSettings,
    pub cors: CorsConfig,
    pub auth: AuthConfig,
    pub servers: HashMap<String, ServerConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveConfig {
    pub bridge: BridgeSettings,
    pub cors: CorsConfig,
    pub auth: AuthConfig,
    pub servers: HashMap<String, ServerConfig>,
}

impl BridgeConfig {
    pub fn effective(&self) -> EffectiveConfig {
        EffectiveConfig {
            bridge: self.settings.clone(),
            cors: self.cors.clone(),
            auth: self.auth.clone(),
            servers: self.servers.clone(),
        }
    }

    /// Load and merge configuration from CLI args and the config file.
    pub fn load(cli: CliArgs) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    BridgeError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                serde_yaml::from_str::<ConfigFile>(&raw).map_err(|e| {
                    BridgeError::Config(format!("cannot parse {}: {e}", path.display()))
                })?
            }
            None => ConfigFile::default(),
        };

        Self::merge(cli, file)
    }

    fn merge(cli: CliArgs, file: ConfigFile) -> Result<Self> {
        let mut settings = BridgeSettings::default();
        let section = file.bridge;

        if let Some(bind) = section.bind {
            settings.bind = bind;
        }
        if let Some(level) = section.log_level {
            settings.log_level = level;
        }
        if let Some(v) = section.session_timeout_ms {
            settings.session_timeout_ms = v;
        }
        if let Some(v) = section.request_timeout_ms {
            settings.request_timeout_ms = v.min(crate::timeouts::request_timeout_max_ms());
        }
        if let Some(v) = section.batch_timeout_ms {
            settings.batch_timeout_ms = v;
        }
        if let Some(v) = section.max_sessions {
            settings.max_sessions = v;
        }
        if let Some(v) = section.max_restart_attempts {
            settings.max_restart_attempts = v;
        }
        if let Some(v) = section.restart_delay_ms {
            settings.restart_delay_ms = v;
        }
        if let Some(v) = section.spawn_wait_ms {
            settings.spawn_wait_ms = v;
        }
        if let Some(v) = section.sse_keep_alive_secs {
            settings.sse_keep_alive_secs = v;
        }

        // CLI (and its env fallbacks) wins over the config file.
        if let Some(bind) = &cli.bind {
            settings.bind = bind.clone();
        }
        if let Some(level) = &cli.log_level {
            settings.log_level = level.clone();
        }

        let config = Self {
            cli,
            settings,
            cors: file.cors.unwrap_or_default(),
            auth: file.auth.unwrap_or_default(),
            servers: file.servers,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(BridgeError::Config(
                "no servers configured; at least one entry under `servers` is required"
                    .to_string(),
            ));
        }

        if self.auth.enabled && self.auth.tokens.is_empty() {
            return Err(BridgeError::Config(
                "auth.enabled is true but auth.tokens is empty".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for (name, server) in &self.servers {
            if server.command.trim().is_empty() {
                return Err(BridgeError::Config(format!(
                    "server '{name}' has an empty command"
                )));
            }
            let endpoint = server.endpoint_for(name);
            if !endpoint.starts_with('/') {
                return Err(BridgeError::Config(format!(
                    "server '{name}' endpoint '{endpoint}' must start with '/'"
                )));
            }
            if matches!(endpoint.as_str(), "/health" | "/stats" | "/mcp") {
                return Err(BridgeError::Config(format!(
                    "server '{name}' endpoint '{endpoint}' collides with a fixed endpoint"
                )));
            }
            if !seen.insert(endpoint.clone()) {
                return Err(BridgeError::Config(format!(
                    "duplicate endpoint '{endpoint}'"
                )));
            }
        }

        Ok(())
    }
}
