//! Text-generation providers.
//!
//! - [`openai`]: OpenAI-compatible chat completions
//! - [`anthropic`]: Anthropic messages API
//! - [`mock`]: Scripted backend for demos and tests
//! - [`sse`]: Upstream SSE line decoding shared by the HTTP providers

pub mod anthropic;
pub mod mock;
pub mod openai;
pub mod sse;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::warn;

use crate::config::{BackendKind, Config, ModelConfig, UnknownModelPolicy};
use crate::translate::GenerationRequest;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend rejected request: {0}")]
    Rejected(String),

    #[error("Backend timed out: {0}")]
    Timeout(String),
}

impl BackendError {
    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            BackendError::Unavailable(_) => "backend_unavailable",
            BackendError::Rejected(_) => "backend_rejected",
            BackendError::Timeout(_) => "backend_timeout",
        }
    }

    /// Classify a non-success HTTP status returned by a provider.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = format!("{status}: {}", body.trim());
        match status.as_u16() {
            400 | 404 | 422 => BackendError::Rejected(message),
            408 | 504 => BackendError::Timeout(message),
            _ => BackendError::Unavailable(message),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            BackendError::from_status(status, "")
        } else {
            BackendError::Unavailable(e.to_string())
        }
    }
}

/// One incremental fragment of generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
}

impl Chunk {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Ordered, lazy sequence of chunks. Dropping it cancels the generation.
pub type ChunkStream = BoxStream<'static, Result<Chunk, BackendError>>;

/// A text-generation provider.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Short provider name for logs and health output.
    fn name(&self) -> &str;

    /// Generate the full reply in one call.
    async fn complete(&self, request: GenerationRequest) -> Result<String, BackendError>;

    /// Open a chunked generation. Errors opening the upstream call are
    /// returned here; errors after that arrive as stream elements.
    async fn stream(&self, request: GenerationRequest) -> Result<ChunkStream, BackendError>;
}

pub type SharedBackend = Arc<dyn GenerationBackend>;

/// Resolves the model identifier sent to the provider.
#[derive(Debug, Clone)]
pub struct ModelPolicy {
    config: ModelConfig,
    default_model: String,
}

impl ModelPolicy {
    pub fn new(config: ModelConfig, kind: BackendKind) -> Self {
        let default_model = config.default_model_for(kind);
        Self {
            config,
            default_model,
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn resolve(&self, requested: Option<&str>) -> Result<String, BackendError> {
        let Some(model) = requested else {
            return Ok(self.default_model.clone());
        };

        if self.config.allowed_models.is_empty()
            || self.config.allowed_models.iter().any(|m| m == model)
        {
            return Ok(model.to_string());
        }

        match self.config.unknown_model {
            UnknownModelPolicy::Reject => {
                Err(BackendError::Rejected(format!("model '{model}' is not supported")))
            }
            UnknownModelPolicy::Fallback => {
                warn!(
                    requested = model,
                    fallback = self.default_model,
                    "Unknown model, using default"
                );
                Ok(self.default_model.clone())
            }
        }
    }

    /// Return a copy of `request` with its model resolved.
    pub fn apply(&self, mut request: GenerationRequest) -> Result<GenerationRequest, BackendError> {
        request.model = Some(self.resolve(request.model.as_deref())?);
        Ok(request)
    }
}

/// Build the backend selected by configuration.
pub fn build_backend(config: &Config) -> anyhow::Result<SharedBackend> {
    let backend: SharedBackend = match config.backend.kind {
        BackendKind::Openai => Arc::new(openai::OpenAiBackend::new(&config.backend)?),
        BackendKind::Anthropic => Arc::new(anthropic::AnthropicBackend::new(&config.backend)?),
        BackendKind::Mock => Arc::new(mock::MockBackend::from_config(&config.backend.mock)),
    };
    Ok(backend)
}

/// Read the API key named by the config, if any.
pub(crate) fn api_key(env_name: Option<&str>) -> Option<String> {
    let name = env_name?;
    match std::env::var(name) {
        Ok(key) if !key.is_empty() => Some(key),
        _ => {
            warn!(env = name, "API key environment variable not set");
            None
        }
    }
}

/// Shared reqwest client construction.
pub(crate) fn http_client(connect_timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(connect_timeout_secs))
        .build()?;
    Ok(client)
}
