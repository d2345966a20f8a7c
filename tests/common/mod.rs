//! Shared fixtures for the integration tests.
//!
//! Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use http::Request;
use serde_json::Value;
use tower::ServiceExt;

use llm_bridge::adapter::{AdapterError, Completion, CompletionAdapter, CompletionParams};
use llm_bridge::config::{ConfigError, ConfigSource, ProviderConfig};
use llm_bridge::proxy::{create_router, AppState, HealthTracker, RequestRouter};
use llm_bridge::registry::{ConfigRegistry, ProviderKind};
use llm_bridge::storage::{UsageEvent, UsageSink};

/// Fixed provider list.
pub struct StaticSource(pub Vec<ProviderConfig>);

impl ConfigSource for StaticSource {
    fn enabled_configs(&self) -> Result<Vec<ProviderConfig>, ConfigError> {
        Ok(self.0.clone())
    }
}

/// Keeps every usage event in memory.
#[derive(Default)]
pub struct RecordingSink(Mutex<Vec<UsageEvent>>);

impl UsageSink for RecordingSink {
    fn record(&self, event: UsageEvent) {
        self.0.lock().unwrap().push(event);
    }
}

impl RecordingSink {
    pub fn events(&self) -> Vec<UsageEvent> {
        self.0.lock().unwrap().clone()
    }
}

/// One scripted upstream outcome.
pub enum Reply {
    Json(Value),
    Chunks(Vec<Result<Value, AdapterError>>),
    Fail(AdapterError),
}

/// Replays queued replies in order and records the params it was called with.
/// Once the queue is empty every call fails with a 500.
#[derive(Default)]
pub struct QueueAdapter {
    replies: Mutex<VecDeque<Reply>>,
    seen: Mutex<Vec<CompletionParams>>,
}

impl QueueAdapter {
    pub fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn last_params(&self) -> Option<CompletionParams> {
        self.seen.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl CompletionAdapter for QueueAdapter {
    async fn complete(&self, params: CompletionParams) -> Result<Completion, AdapterError> {
        self.seen.lock().unwrap().push(params);
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Json(body)) => Ok(Completion::Response(body)),
            Some(Reply::Chunks(items)) => {
                Ok(Completion::Stream(Box::pin(futures::stream::iter(items))))
            }
            Some(Reply::Fail(e)) => Err(e),
            None => Err(AdapterError::Status {
                status: 500,
                body: "no scripted reply".to_string(),
            }),
        }
    }
}

pub fn provider(id: &str, model: &str, endpoints: &[&str]) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        kind: ProviderKind::OpenAi,
        base_url: String::new(),
        api_key: None,
        model_name: model.to_string(),
        public_name: String::new(),
        enabled: true,
        available_endpoints: endpoints.iter().map(|e| e.to_string()).collect::<HashSet<_>>(),
    }
}

/// Everything a test needs to drive one endpoint.
pub struct TestApp {
    pub router: Arc<RequestRouter>,
    pub adapter: Arc<QueueAdapter>,
    pub sink: Arc<RecordingSink>,
}

impl TestApp {
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self::with_source(Arc::new(StaticSource(providers)))
    }

    pub fn with_source(source: Arc<dyn ConfigSource>) -> Self {
        let registry = Arc::new(ConfigRegistry::load(source).unwrap());
        let adapter = Arc::new(QueueAdapter::default());
        let sink = Arc::new(RecordingSink::default());
        let router = Arc::new(RequestRouter::new(
            registry,
            Arc::new(HealthTracker::default()),
            adapter.clone(),
            sink.clone(),
            Duration::from_secs(30),
        ));
        Self {
            router,
            adapter,
            sink,
        }
    }

    /// The axum app as seen from `endpoint`.
    pub fn app(&self, endpoint: &str) -> axum::Router {
        create_router(AppState {
            endpoint: Arc::from(endpoint),
            router: self.router.clone(),
            db: None,
        })
    }
}

pub fn chat_request(model: &str, stream: bool) -> Request<Body> {
    post_json(
        "/v1/chat/completions",
        serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "hello"}],
            "stream": stream,
        }),
    )
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

/// Send one request and parse the JSON body.
pub async fn send_json(app: axum::Router, request: Request<Body>) -> (http::StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .expect("read body");
    let json: Value = serde_json::from_slice(&bytes).unwrap_or_default();
    (status, json)
}

/// Send one request and return the raw body text.
pub async fn send_text(app: axum::Router, request: Request<Body>) -> (http::StatusCode, String) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .expect("read body");
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

pub fn completion(text: &str) -> Value {
    serde_json::json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "upstream-model",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": text}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
    })
}

pub fn chunk(text: &str) -> Value {
    serde_json::json!({
        "object": "chat.completion.chunk",
        "model": "upstream-model",
        "choices": [{"index": 0, "delta": {"content": text}}]
    })
}
