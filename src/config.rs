//! Runtime configuration for token-relay.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every section falls back to its defaults, so a config file only needs the
//! keys it wants to override.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "token-relay", about = "Chat backend relaying LLM token streams over SSE")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides `server.listen`).
    #[arg(long)]
    pub listen: Option<String>,

    /// Generation backend (overrides `backend.kind`).
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration.
    pub server: ServerConfig,

    /// Generation backend configuration.
    pub backend: BackendConfig,

    /// Model selection policy.
    pub models: ModelConfig,

    /// Streaming relay tuning.
    pub relay: RelayConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Timeout for the synchronous completion path, in seconds.
    pub request_timeout_secs: u64,

    /// Allow cross-origin requests from any origin.
    pub cors_allow_any: bool,

    /// Interval between SSE keep-alive comments on idle streams (0 = off).
    pub keep_alive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 120,
            cors_allow_any: true,
            keep_alive_secs: 15,
        }
    }
}

impl ServerConfig {
    pub fn keep_alive(&self) -> Option<std::time::Duration> {
        (self.keep_alive_secs > 0).then(|| std::time::Duration::from_secs(self.keep_alive_secs))
    }
}

/// Which provider implementation serves generation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Any OpenAI-compatible chat completions endpoint.
    Openai,
    /// Anthropic messages API.
    Anthropic,
    /// Local scripted backend, no network.
    Mock,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Openai => write!(f, "openai"),
            BackendKind::Anthropic => write!(f, "anthropic"),
            BackendKind::Mock => write!(f, "mock"),
        }
    }
}

/// Generation backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Provider implementation.
    pub kind: BackendKind,

    /// Base URL of the provider API (None = provider default).
    pub base_url: Option<String>,

    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,

    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Maximum tokens to request (required by some providers).
    pub max_tokens: u32,

    /// Role mapping from the chat widget's vocabulary to the provider's.
    /// Roles not listed pass through unchanged.
    pub roles: BTreeMap<String, String>,

    /// Mock backend settings (used when `kind` is `mock`).
    pub mock: MockConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Openai,
            base_url: None,
            api_key_env: None,
            connect_timeout_secs: 10,
            max_tokens: 1024,
            roles: BTreeMap::from([("ai".to_string(), "assistant".to_string())]),
            mock: MockConfig::default(),
        }
    }
}

impl BackendConfig {
    /// Base URL, falling back to the provider's public endpoint.
    pub fn base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => match self.kind {
                BackendKind::Openai => "https://api.openai.com/v1".to_string(),
                BackendKind::Anthropic => "https://api.anthropic.com/v1".to_string(),
                BackendKind::Mock => String::new(),
            },
        }
    }

    /// Environment variable holding the API key, with provider defaults.
    pub fn api_key_env(&self) -> Option<&str> {
        match (&self.api_key_env, self.kind) {
            (Some(name), _) => Some(name.as_str()),
            (None, BackendKind::Openai) => Some("OPENAI_API_KEY"),
            (None, BackendKind::Anthropic) => Some("ANTHROPIC_API_KEY"),
            (None, BackendKind::Mock) => None,
        }
    }
}

/// Mock backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Fixed reply. When unset the mock echoes the last user message.
    pub reply: Option<String>,

    /// Delay before each chunk, in milliseconds.
    pub chunk_delay_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            reply: None,
            chunk_delay_ms: 30,
        }
    }
}

/// What to do when a request names a model outside `allowed_models`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownModelPolicy {
    /// Fail fast with a rejected-request error.
    Reject,
    /// Substitute the default model.
    Fallback,
}

/// Model selection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model used when the request does not name one (unset = provider default).
    pub default_model: Option<String>,

    /// Accepted model identifiers (empty = accept any).
    pub allowed_models: Vec<String>,

    /// Handling of identifiers outside `allowed_models`.
    pub unknown_model: UnknownModelPolicy,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default_model: None,
            allowed_models: Vec::new(),
            unknown_model: UnknownModelPolicy::Reject,
        }
    }
}

impl ModelConfig {
    /// Configured default model, falling back to the provider's usual choice.
    pub fn default_model_for(&self, kind: BackendKind) -> String {
        match (&self.default_model, kind) {
            (Some(model), _) => model.clone(),
            (None, BackendKind::Openai) => "gpt-3.5-turbo".to_string(),
            (None, BackendKind::Anthropic) => "claude-3-5-sonnet-20240620".to_string(),
            (None, BackendKind::Mock) => "mock".to_string(),
        }
    }
}

/// Streaming relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Maximum wait for the next chunk before the stream is failed (0 = no limit).
    pub chunk_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_timeout_secs: 60,
        }
    }
}

impl RelayConfig {
    pub fn chunk_timeout(&self) -> Option<std::time::Duration> {
        (self.chunk_timeout_secs > 0).then(|| std::time::Duration::from_secs(self.chunk_timeout_secs))
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides on top of the loaded file.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(kind) = cli.backend {
            self.backend.kind = kind;
        }
    }
}
