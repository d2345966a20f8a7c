//! Integration tests for the HTTP adapter against a mock upstream.
//!
//! Verifies that:
//! - The upstream receives the mapped model name and the bearer key
//! - Streaming requests get `stream_options.include_usage` injected
//! - SSE bodies are decoded into chunks and stop at `[DONE]`
//! - Upstream error statuses surface as classified client errors end to end

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{chat_request, send_json, send_text, RecordingSink, StaticSource};
use llm_bridge::adapter::{
    AdapterError, Completion, CompletionAdapter, CompletionParams, HttpCompletionAdapter,
};
use llm_bridge::config::{ApiKey, ProviderConfig};
use llm_bridge::proxy::{
    create_router, AppState, ChatCompletionRequest, HealthTracker, Message, RequestRouter,
};
use llm_bridge::registry::{ConfigRegistry, ProviderKind, RegistrySnapshot};
use llm_bridge::storage::UsageStatus;

fn upstream_provider(server: &MockServer) -> ProviderConfig {
    ProviderConfig {
        id: "mock".to_string(),
        kind: ProviderKind::OpenAiCompatible,
        base_url: format!("{}/v1", server.uri()),
        api_key: Some(ApiKey::from("sk-mock-key")),
        model_name: "mock-7b".to_string(),
        public_name: "house-model".to_string(),
        enabled: true,
        available_endpoints: ["general".to_string()].into_iter().collect(),
    }
}

fn params(server: &MockServer, stream: bool) -> CompletionParams {
    let snapshot = RegistrySnapshot::build(vec![upstream_provider(server)]);
    let provider = snapshot.lookup("house-model").unwrap();
    CompletionParams::new(
        &provider,
        ChatCompletionRequest {
            model: Some("house-model".to_string()),
            messages: vec![Message::user("ping")],
            stream: Some(stream),
            ..Default::default()
        },
    )
}

fn adapter() -> HttpCompletionAdapter {
    HttpCompletionAdapter::with_connect_timeout(Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn test_non_streaming_request_shape() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-mock-key"))
        .and(body_partial_json(serde_json::json!({"model": "mock-7b"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "model": "mock-7b",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "pong"}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let completion = adapter().complete(params(&server, false)).await.unwrap();
    match completion {
        Completion::Response(body) => {
            assert_eq!(body["choices"][0]["message"]["content"], "pong");
        }
        Completion::Stream(_) => panic!("expected a complete response"),
    }
}

#[tokio::test]
async fn test_streaming_injects_usage_and_decodes_sse() {
    let server = MockServer::start().await;
    let sse = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"po\"}}]}\n\n",
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"ng\"}}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":2,\"total_tokens\":4}}\n\n",
        "data: [DONE]\n\n",
        "data: {\"after\":\"done\"}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({
            "stream": true,
            "stream_options": {"include_usage": true}
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse),
        )
        .expect(1)
        .mount(&server)
        .await;

    let completion = adapter().complete(params(&server, true)).await.unwrap();
    let Completion::Stream(chunks) = completion else {
        panic!("expected a stream");
    };
    let chunks: Vec<_> = chunks.collect().await;

    assert_eq!(chunks.len(), 3);
    let first = chunks[0].as_ref().unwrap();
    assert_eq!(first["choices"][0]["delta"]["content"], "po");
    let last = chunks[2].as_ref().unwrap();
    assert_eq!(last["usage"]["total_tokens"], 4);
}

#[tokio::test]
async fn test_error_status_keeps_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_string(
            r#"{"error":{"message":"The model `mock-7b` does not exist"}}"#,
        ))
        .mount(&server)
        .await;

    let err = adapter().complete(params(&server, false)).await.unwrap_err();
    match err {
        AdapterError::Status { status, body } => {
            assert_eq!(status, 404);
            assert!(body.contains("does not exist"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_unreachable_upstream_is_connect_error() {
    // Nothing listens on port 9 on the loopback interface
    let provider = ProviderConfig {
        base_url: "http://127.0.0.1:9/v1".to_string(),
        ..upstream_provider(&MockServer::start().await)
    };
    let snapshot = RegistrySnapshot::build(vec![provider]);
    let params = CompletionParams::new(
        &snapshot.lookup("house-model").unwrap(),
        ChatCompletionRequest {
            model: Some("house-model".to_string()),
            messages: vec![Message::user("ping")],
            ..Default::default()
        },
    );

    let err = adapter().complete(params).await.unwrap_err();
    assert!(matches!(err, AdapterError::Connect(_)), "{err:?}");
}

// ============================================================================
// Full pipeline: axum app -> router -> HTTP adapter -> mock upstream
// ============================================================================

fn pipeline(server: &MockServer) -> (axum::Router, Arc<RecordingSink>) {
    let registry = Arc::new(
        ConfigRegistry::load(Arc::new(StaticSource(vec![upstream_provider(server)]))).unwrap(),
    );
    let sink = Arc::new(RecordingSink::default());
    let router = Arc::new(RequestRouter::new(
        registry,
        Arc::new(HealthTracker::default()),
        Arc::new(adapter()),
        sink.clone(),
        Duration::from_secs(5),
    ));
    let app = create_router(AppState {
        endpoint: Arc::from("general"),
        router,
        db: None,
    });
    (app, sink)
}

#[tokio::test]
async fn test_rate_limit_classified_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429).set_body_string("Rate limit reached for org-SECRET123"),
        )
        .mount(&server)
        .await;

    let (app, sink) = pipeline(&server);
    let (status, json) = send_json(app, chat_request("house-model", false)).await;

    assert_eq!(status, http::StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["error"]["type"], "rate_limit_error");
    assert_eq!(json["error"]["model"], "house-model");
    assert!(!json.to_string().contains("SECRET123"));

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, UsageStatus::Error);
    assert_eq!(events[0].model_name, "mock-7b");
    assert_eq!(events[0].public_name, "house-model");
}

#[tokio::test]
async fn test_stream_end_to_end() {
    let server = MockServer::start().await;
    let sse = concat!(
        "data: {\"model\":\"mock-7b\",\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n",
        "data: {\"model\":\"mock-7b\",\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":1,\"total_tokens\":4}}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse),
        )
        .mount(&server)
        .await;

    let (app, sink) = pipeline(&server);
    let (status, body) = send_text(app, chat_request("house-model", true)).await;

    assert_eq!(status, http::StatusCode::OK);
    assert!(body.contains("\"model\":\"house-model\""));
    assert!(!body.contains("mock-7b"));
    assert!(body.ends_with("data: [DONE]\n\n"));

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, UsageStatus::Success);
    assert_eq!(events[0].total_tokens, 4);
}
