use crate::backend::BackendKind;
use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "anthropic-gateway";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub params: ParamsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_kind")]
    pub kind: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the credential. Defaults per kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub big_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub small_model: Option<String>,
    #[serde(default)]
    pub models: HashMap<String, String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sandbox root for file, search and shell tools. Defaults to the CWD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub shell_whitelist: Vec<String>,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamsConfig {
    #[serde(default = "default_drop_params")]
    pub drop: Vec<String>,
}

fn default_port() -> u16 {
    8082
}

fn default_kind() -> BackendKind {
    BackendKind::OpenRouter
}

fn default_request_timeout() -> u64 {
    300
}

fn default_stream_idle_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_tool_timeout() -> u64 {
    30
}

fn default_max_turns() -> u32 {
    8
}

fn default_max_depth() -> usize {
    10
}

fn default_max_output_bytes() -> usize {
    100_000
}

fn default_drop_params() -> Vec<String> {
    vec![
        "betas".to_string(),
        "anthropic_beta".to_string(),
        "context_management".to_string(),
        "reasoning_effort".to_string(),
    ]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            backend: BackendConfig::default(),
            tools: ToolsConfig::default(),
            params: ParamsConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            base_url: None,
            api_key_env: None,
            big_model: None,
            small_model: None,
            models: HashMap::new(),
            request_timeout_secs: default_request_timeout(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: None,
            timeout_secs: default_tool_timeout(),
            max_turns: default_max_turns(),
            max_depth: default_max_depth(),
            max_output_bytes: default_max_output_bytes(),
            shell_whitelist: Vec::new(),
            allowed_domains: Vec::new(),
        }
    }
}

impl Default for ParamsConfig {
    fn default() -> Self {
        Self {
            drop: default_drop_params(),
        }
    }
}

impl BackendConfig {
    /// Base URL from the file, or the preset default for the kind.
    pub fn effective_base_url(&self) -> Option<String> {
        self.base_url
            .clone()
            .or_else(|| self.kind.preset().default_base_url.map(str::to_string))
    }

    pub fn effective_api_key_env(&self) -> String {
        self.api_key_env
            .clone()
            .unwrap_or_else(|| self.kind.preset().default_api_key_env.to_string())
    }
}

impl ToolsConfig {
    pub fn root_dir(&self) -> Result<PathBuf> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            ProxyError::config(format!("Invalid config file {}: {}", path.display(), e))
        })
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir. With no file anywhere
    /// the defaults are returned and the environment is expected to fill in.
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(&candidate);
            }
        }

        tracing::info!("No config file found, configuring from environment");
        Ok(Self::default())
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `GATEWAY_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(kind) = lookup("GATEWAY_BACKEND") {
            self.backend.kind = kind.parse()?;
        }
        if let Some(url) = lookup("GATEWAY_BASE_URL") {
            self.backend.base_url = Some(url);
        }
        if let Some(env) = lookup("GATEWAY_API_KEY_ENV") {
            self.backend.api_key_env = Some(env);
        }
        if let Some(model) = lookup("GATEWAY_BIG_MODEL") {
            self.backend.big_model = Some(model);
        }
        if let Some(model) = lookup("GATEWAY_SMALL_MODEL") {
            self.backend.small_model = Some(model);
        }
        if let Some(port) = lookup("GATEWAY_PORT") {
            self.port = port
                .trim()
                .parse()
                .map_err(|_| ProxyError::config(format!("GATEWAY_PORT is not a port: '{port}'")))?;
        }
        if let Some(root) = lookup("GATEWAY_TOOL_ROOT") {
            self.tools.root = Some(PathBuf::from(root));
        }
        Ok(())
    }

    /// Reject configurations the gateway must not serve with.
    pub fn validate(&self) -> Result<()> {
        let kind = self.backend.kind;
        let base_url = self.backend.effective_base_url().ok_or_else(|| {
            ProxyError::config(format!(
                "Backend '{kind}' requires backend.base_url (or GATEWAY_BASE_URL)"
            ))
        })?;

        let parsed = url::Url::parse(&base_url).map_err(|e| {
            ProxyError::config(format!("Invalid backend.base_url '{base_url}': {e}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ProxyError::config(format!(
                "backend.base_url must be http or https, got '{}'",
                parsed.scheme()
            )));
        }

        if self.backend.request_timeout_secs == 0 {
            return Err(ProxyError::config("backend.request_timeout_secs must be > 0"));
        }
        if self.tools.max_turns == 0 {
            return Err(ProxyError::config("tools.max_turns must be at least 1"));
        }

        if self.tools.enabled {
            let root = self.tools.root_dir()?;
            if !root.is_dir() {
                return Err(ProxyError::config(format!(
                    "tools.root '{}' is not a directory",
                    root.display()
                )));
            }
        }

        Ok(())
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from(format!("{APP_DIR}.toml")));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join(APP_DIR)
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join(APP_DIR).join("config.toml"));
        }
        if let Some(home) = dirs_path() {
            paths.push(home.join(".config").join(APP_DIR).join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(format!(".{APP_DIR}.toml")));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
