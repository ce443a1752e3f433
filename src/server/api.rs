//! HTTP API for chat widgets.
//!
//! - POST /chat         full reply as `{"text": ...}`
//! - POST /chat-stream  SSE relay of the token stream
//! - GET /health
//! - GET /metrics

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{BackendError, ModelPolicy, SharedBackend};
use crate::config::Config;
use crate::server::encoder::{encode_completion, ErrorBody, TextBody};
use crate::server::metrics::Metrics;
use crate::server::relay::RelaySession;
use crate::server::sink;
use crate::translate::{GenerationRequest, RequestTranslator, RoleTable, TranslateError};

/// Application state shared across handlers. Read-only after startup.
pub struct AppState {
    pub config: Arc<Config>,
    pub backend: SharedBackend,
    pub translator: RequestTranslator,
    pub models: ModelPolicy,
    pub metrics: Metrics,
    /// Parent of every relay session's cancellation token.
    pub shutdown: CancellationToken,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        backend: SharedBackend,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            translator: RequestTranslator::new(RoleTable::new(config.backend.roles.clone())),
            models: ModelPolicy::new(config.models.clone(), config.backend.kind),
            metrics: Metrics::new()?,
            config,
            backend,
            shutdown,
            start_time: Instant::now(),
        })
    }

    fn prepare(&self, body: &[u8]) -> Result<GenerationRequest, ApiError> {
        let request = self.translator.translate(body)?;
        Ok(self.models.apply(request)?)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.request_timeout_secs)
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = state
        .config
        .server
        .cors_allow_any
        .then(CorsLayer::permissive);

    Router::new()
        .route("/chat", post(chat))
        .route("/chat-stream", post(chat_stream))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .option_layer(cors),
        )
}

// ─── Errors ────────────────────────────────────────────────────────────────

/// Failures reported before a response is committed.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Server is shutting down")]
    ShuttingDown,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Translate(_) => StatusCode::BAD_REQUEST,
            ApiError::Backend(BackendError::Rejected(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Backend(BackendError::Unavailable(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Backend(BackendError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Translate(TranslateError::MalformedRequest(_)) => "malformed_request",
            ApiError::Backend(e) => e.code(),
            ApiError::ShuttingDown => "shutting_down",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

fn outcome<T>(result: &Result<T, ApiError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn chat(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<TextBody>, ApiError> {
    let request_id = Uuid::new_v4();
    let result = complete(&state, request_id, &body).await;
    state.metrics.record_request("chat", outcome(&result));
    if let Err(e) = &result {
        warn!(request_id = %request_id, error = %e, "Chat request failed");
    }
    result
}

async fn complete(state: &AppState, request_id: Uuid, body: &[u8]) -> Result<Json<TextBody>, ApiError> {
    let request = state.prepare(body)?;
    info!(
        request_id = %request_id,
        model = request.model.as_deref().unwrap_or_default(),
        messages = request.messages.len(),
        "Chat request"
    );

    let timeout = state.request_timeout();
    let text = tokio::time::timeout(timeout, state.backend.complete(request))
        .await
        .map_err(|_| BackendError::Timeout(format!("no reply within {}s", timeout.as_secs())))??;

    Ok(Json(encode_completion(text)))
}

async fn chat_stream(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let result = relay(state.clone(), &body).await;
    state.metrics.record_request("chat_stream", outcome(&result));
    if let Err(e) = &result {
        warn!(error = %e, "Stream request failed before streaming");
    }
    result
}

async fn relay(state: Arc<AppState>, body: &[u8]) -> Result<Response, ApiError> {
    let request = state.prepare(body)?;
    let model = request.model.clone().unwrap_or_default();
    let messages = request.messages.len();

    let timeout = state.request_timeout();
    let chunks = tokio::time::timeout(timeout, state.backend.stream(request))
        .await
        .map_err(|_| BackendError::Timeout(format!("stream not opened within {}s", timeout.as_secs())))??;

    let (sink, receiver) = sink::channel();
    let session = RelaySession::new(sink, state.shutdown.child_token())
        .with_chunk_timeout(state.config.relay.chunk_timeout());

    info!(
        session = %session.id(),
        backend = state.backend.name(),
        model,
        messages,
        "Stream request"
    );

    state.metrics.session_started();
    let task_state = state.clone();
    tokio::spawn(async move {
        let report = session.start(chunks).await;
        task_state
            .metrics
            .session_finished(task_state.backend.name(), &report);
    });

    receiver
        .into_response(state.config.server.keep_alive())
        .await
        .map_err(|_| ApiError::ShuttingDown)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: String,
    uptime_secs: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        backend: state.backend.name().to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}
