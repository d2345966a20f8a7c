//! HTTP request handlers.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::Utc;

use super::dispatch::{Dispatched, RequestContext};
use super::health::ServiceHealth;
use super::server::{AppState, RequestId};
use super::types::{ChatCompletionRequest, CompletionRequest};
use crate::error::Error;

fn client_ip(connect_info: Option<ConnectInfo<SocketAddr>>) -> String {
    connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn request_context(
    state: &AppState,
    request_id: RequestId,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> RequestContext {
    RequestContext {
        request_id: request_id.0,
        endpoint: state.endpoint.to_string(),
        client_ip: client_ip(connect_info),
    }
}

/// Turn a router outcome into an HTTP response.
fn into_http(dispatched: Dispatched) -> Result<Response, Error> {
    match dispatched {
        Dispatched::Complete(body) => Ok(Json(body).into_response()),
        Dispatched::Stream(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header("x-accel-buffering", HeaderValue::from_static("no"))
            .body(Body::from_stream(body))
            .map_err(|e| Error::Internal(format!("Failed to build stream response: {}", e))),
    }
}

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let Json(request) = payload.map_err(|e| Error::InvalidRequest(e.body_text()))?;
    let ctx = request_context(&state, request_id, connect_info);

    let dispatched = state.router.route(&ctx, request).await?;
    into_http(dispatched)
}

/// Handle POST /v1/completions by rewriting the prompt as one user message.
pub async fn completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    payload: Result<Json<CompletionRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let Json(request) = payload.map_err(|e| Error::InvalidRequest(e.body_text()))?;
    let ctx = request_context(&state, request_id, connect_info);

    let dispatched = state.router.route(&ctx, request.into_chat()).await?;
    into_http(dispatched)
}

/// Handle GET /v1/models - models exposed on this endpoint
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.router.list_models(&state.endpoint))
}

/// Handle GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "llm-bridge",
        "endpoint": state.endpoint.as_ref(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Handle GET /health/services - per-service health state
pub async fn service_health(State(state): State<AppState>) -> impl IntoResponse {
    let services: BTreeMap<String, ServiceHealth> = state
        .router
        .health()
        .all()
        .into_iter()
        .map(|s| (s.service_id.clone(), s))
        .collect();

    Json(serde_json::json!({
        "services": services,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Handle POST /admin/reload - rebuild the model registry from its source
///
/// Sources may do blocking I/O, so the rebuild runs off the async workers.
pub async fn reload(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.router.registry().clone();
    let outcome = match tokio::task::spawn_blocking(move || registry.reload()).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(e) => Err(format!("reload task failed: {}", e)),
    };

    match outcome {
        Ok(summary) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "success",
                "message": format!("Configuration reloaded: {} models", summary.models),
                "models": summary.models,
                "version": summary.version,
                "timestamp": Utc::now().to_rfc3339(),
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Configuration reload failed; keeping previous registry");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "status": "error",
                    "message": format!("Failed to reload configuration: {}", e),
                    "timestamp": Utc::now().to_rfc3339(),
                })),
            )
        }
    }
}
