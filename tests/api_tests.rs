//! End-to-end tests of the HTTP surface against the mock backend.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use token_relay::backend::mock::{MockBackend, MockStats, MockStep};
use token_relay::backend::{BackendError, SharedBackend};
use token_relay::config::{Config, UnknownModelPolicy};
use token_relay::server::api::{build_router, AppState};
use token_relay::server::encoder::{decode, WireEvent};

struct TestServer {
    base: String,
    stats: Arc<MockStats>,
    shutdown: CancellationToken,
}

async fn spawn_server(backend: MockBackend, config: Config) -> TestServer {
    let stats = backend.stats();
    let backend: SharedBackend = Arc::new(backend);
    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::new(Arc::new(config), backend, shutdown.clone()).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        stats,
        shutdown,
    }
}

#[tokio::test]
async fn test_stream_end_to_end() {
    let server = spawn_server(MockBackend::scripted(["He", "llo", "!"]), Config::default()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/chat-stream", server.base))
        .json(&json!({"model": "x", "messages": [{"role": "user", "text": "Hello"}]}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert_eq!(response.headers()["cache-control"], "no-cache");

    let body = response.text().await.unwrap();
    assert_eq!(
        body,
        "data: {\"text\":\"He\"}\n\ndata: {\"text\":\"llo\"}\n\ndata: {\"text\":\"!\"}\n\ndata: [DONE]\n\n"
    );
    assert_eq!(server.stats.calls(), 1);
}

#[tokio::test]
async fn test_sync_chat_returns_text() {
    let server = spawn_server(MockBackend::echo(), Config::default()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/chat", server.base))
        .json(&json!({"messages": [
            {"role": "user", "text": "first"},
            {"role": "ai", "text": "reply"},
            {"role": "user", "text": "echo this back"}
        ]}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"text": "echo this back"}));
}

#[tokio::test]
async fn test_malformed_request_never_reaches_backend() {
    let server = spawn_server(MockBackend::echo(), Config::default()).await;
    let client = reqwest::Client::new();

    for route in ["chat", "chat-stream"] {
        let response = client
            .post(format!("{}/{route}", server.base))
            .json(&json!({"messages": [{"role": "user"}]}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["code"], "malformed_request");
        assert!(body["error"].as_str().unwrap().contains("text"));
    }
    assert_eq!(server.stats.calls(), 0);
}

#[tokio::test]
async fn test_backend_failure_before_streaming_is_structured() {
    let backend = MockBackend::echo().failing_open(BackendError::Unavailable("no capacity".to_string()));
    let server = spawn_server(backend, Config::default()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/chat-stream", server.base))
        .json(&json!({"messages": [{"role": "user", "text": "hi"}]}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    assert_eq!(response.headers()["content-type"], "application/json");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "backend_unavailable");
}

#[tokio::test]
async fn test_backend_failure_mid_stream_is_in_band() {
    let backend = MockBackend::with_steps(vec![
        MockStep::Chunk("partial".to_string()),
        MockStep::Fail(BackendError::Timeout("stalled".to_string())),
    ]);
    let server = spawn_server(backend, Config::default()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/chat-stream", server.base))
        .json(&json!({"messages": [{"role": "user", "text": "hi"}]}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let events = decode(&response.text().await.unwrap()).unwrap();
    assert_eq!(events[0], WireEvent::Data("partial".to_string()));
    assert!(matches!(&events[1], WireEvent::Error { code, .. } if code == "backend_timeout"));
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn test_unknown_model_rejected_by_policy() {
    let mut config = Config::default();
    config.models.allowed_models = vec!["gpt-4o".to_string()];
    config.models.unknown_model = UnknownModelPolicy::Reject;
    let server = spawn_server(MockBackend::echo(), config).await;

    let response = reqwest::Client::new()
        .post(format!("{}/chat", server.base))
        .json(&json!({"model": "made-up", "messages": [{"role": "user", "text": "hi"}]}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 422);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "backend_rejected");
    assert_eq!(server.stats.calls(), 0);
}

#[tokio::test]
async fn test_client_disconnect_releases_backend_stream() {
    let backend = MockBackend::scripted((0..1000).map(|i| format!("w{i} ")))
        .with_chunk_delay(Duration::from_millis(10));
    let server = spawn_server(backend, Config::default()).await;

    let mut response = reqwest::Client::new()
        .post(format!("{}/chat-stream", server.base))
        .json(&json!({"messages": [{"role": "user", "text": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert!(response.chunk().await.unwrap().is_some());
    drop(response);

    let mut released = false;
    for _ in 0..100 {
        if server.stats.released() == 1 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released, "backend stream still running after disconnect");
    assert!(server.stats.pulled() < 1000);
}

#[tokio::test]
async fn test_shutdown_aborts_live_streams() {
    let backend = MockBackend::scripted((0..1000).map(|i| format!("w{i} ")))
        .with_chunk_delay(Duration::from_millis(10));
    let server = spawn_server(backend, Config::default()).await;

    let mut response = reqwest::Client::new()
        .post(format!("{}/chat-stream", server.base))
        .json(&json!({"messages": [{"role": "user", "text": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert!(response.chunk().await.unwrap().is_some());

    server.shutdown.cancel();

    let rest = tokio::time::timeout(Duration::from_secs(2), async {
        let mut rest = Vec::new();
        while let Ok(Some(chunk)) = response.chunk().await {
            rest.extend_from_slice(&chunk);
        }
        rest
    })
    .await
    .expect("stream did not end after shutdown");

    assert!(!String::from_utf8_lossy(&rest).contains("[DONE]"));
    assert_eq!(server.stats.released(), 1);
}

#[tokio::test]
async fn test_health_and_metrics() {
    let server = spawn_server(MockBackend::scripted(["ok"]), Config::default()).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/chat-stream", server.base))
        .json(&json!({"messages": [{"role": "user", "text": "hi"}]}))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let health: Value = client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["backend"], "mock");

    let metrics = client
        .get(format!("{}/metrics", server.base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("token_relay_requests_total{outcome=\"ok\",route=\"chat_stream\"} 1"));
}

#[tokio::test]
async fn test_cors_follows_config() {
    let client = reqwest::Client::new();

    let open = spawn_server(MockBackend::echo(), Config::default()).await;
    let response = client
        .get(format!("{}/health", open.base))
        .header("origin", "http://widget.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["access-control-allow-origin"], "*");

    let mut config = Config::default();
    config.server.cors_allow_any = false;
    let closed = spawn_server(MockBackend::echo(), config).await;
    let response = client
        .get(format!("{}/health", closed.base))
        .header("origin", "http://widget.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().get("access-control-allow-origin").is_none());
}
