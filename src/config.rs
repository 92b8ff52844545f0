// ABOUTME: Gateway configuration parsing from TOML file with environment overrides
// ABOUTME: Validates fields and provides sensible defaults; secrets are redacted from Debug output

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crosswire_core::config::{CronConfig, RequestLimits};
use crosswire_core::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub requests: RequestLimits,
    #[serde(default)]
    pub cron: CronConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory holding the persisted request and job documents
    #[serde(default = "default_workspace_path")]
    pub path: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            path: default_workspace_path(),
        }
    }
}

fn default_workspace_path() -> String {
    paths::data_dir().to_string_lossy().to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Optional shared key; mutating endpoints require it when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

// Custom Debug impl to redact the API key
impl std::fmt::Debug for HttpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
            api_key: None,
        }
    }
}

fn default_http_host() -> String {
    // Localhost by default; override for Docker (needs 0.0.0.0)
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8787
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Command spawned for one isolated agent turn; the job message arrives
    /// on stdin and the final response is read from stdout
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Hard ceiling on a single run when the job carries no timeout of its own
    #[serde(default = "default_runner_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: default_runner_timeout_secs(),
        }
    }
}

fn default_runner_timeout_secs() -> u64 {
    300 // 5 minutes
}

impl Config {
    /// Load from $CROSSWIRE_CONFIG, falling back to the XDG config path.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CROSSWIRE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| paths::config_file());
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}
