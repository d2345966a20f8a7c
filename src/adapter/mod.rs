//! Provider adapters.
//!
//! A [`CompletionAdapter`] turns one resolved chat request into either a
//! complete JSON response or a stream of JSON chunks. The router never sees
//! vendor wire formats; everything an adapter returns is already in the
//! OpenAI chat-completions shape.

mod http;
mod sse;

pub use http::HttpCompletionAdapter;
pub use sse::{SseDecoder, SseEvent};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::config::ApiKey;
use crate::proxy::types::ChatCompletionRequest;
use crate::registry::{ProviderKind, ResolvedProvider};

/// Failure reported by an adapter.
///
/// Messages may contain raw provider text and must be classified before
/// anything reaches a client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connect(String),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid upstream response: {0}")]
    Decode(String),

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AdapterError::Timeout(e.to_string())
        } else if e.is_connect() {
            AdapterError::Connect(e.to_string())
        } else if e.is_decode() || e.is_body() {
            AdapterError::Decode(e.to_string())
        } else {
            AdapterError::Other(e.to_string())
        }
    }
}

/// Everything an adapter needs for one call.
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub provider_id: String,
    pub kind: ProviderKind,
    pub url: String,
    pub api_key: Option<ApiKey>,
    /// Request body with `model` already mapped to the upstream name.
    pub request: ChatCompletionRequest,
}

impl CompletionParams {
    /// Bind a client request to a resolved provider.
    pub fn new(provider: &ResolvedProvider, mut request: ChatCompletionRequest) -> Self {
        request.model = Some(provider.upstream.model.clone());
        Self {
            provider_id: provider.config.id.clone(),
            kind: provider.kind(),
            url: provider.upstream.url.clone(),
            api_key: provider.upstream.api_key.clone(),
            request,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.request.is_streaming()
    }
}

/// Stream of OpenAI-shaped chunks. The stream ends after the last chunk;
/// the `[DONE]` sentinel is not yielded.
pub type ChunkStream = BoxStream<'static, Result<Value, AdapterError>>;

/// What an adapter produced.
pub enum Completion {
    Response(Value),
    Stream(ChunkStream),
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Response(v) => f.debug_tuple("Response").field(v).finish(),
            Completion::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Translates a chat request into a provider call.
#[async_trait]
pub trait CompletionAdapter: Send + Sync {
    async fn complete(&self, params: CompletionParams) -> Result<Completion, AdapterError>;
}
