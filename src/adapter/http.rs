//! HTTP adapter for OpenAI-compatible upstreams.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use super::sse::{SseDecoder, SseEvent};
use super::{AdapterError, ChunkStream, Completion, CompletionAdapter, CompletionParams};
use crate::proxy::types::ensure_stream_options;

/// Longest error body kept from a failed upstream response.
const MAX_ERROR_BODY: usize = 2048;

/// Speaks the OpenAI chat-completions protocol to every configured kind.
///
/// The per-kind differences (base URL, path, model name) are already applied
/// in [`CompletionParams`]; this adapter only handles transport.
#[derive(Debug, Clone)]
pub struct HttpCompletionAdapter {
    client: Client,
}

impl HttpCompletionAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client with a connect timeout. The overall request deadline is
    /// enforced by the router.
    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl CompletionAdapter for HttpCompletionAdapter {
    async fn complete(&self, mut params: CompletionParams) -> Result<Completion, AdapterError> {
        let streaming = params.is_streaming();
        if streaming {
            ensure_stream_options(&mut params.request);
        }

        let mut upstream_request = self
            .client
            .post(&params.url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&params.request);

        if let Some(api_key) = &params.api_key {
            upstream_request = upstream_request.bearer_auth(api_key.expose_secret());
        }
        if streaming {
            upstream_request = upstream_request.header(header::ACCEPT, "text/event-stream");
        }

        tracing::debug!(
            provider = %params.provider_id,
            kind = %params.kind,
            url = %params.url,
            streaming,
            "Sending upstream request"
        );

        let upstream_response = upstream_request.send().await?;

        let status = upstream_response.status();
        if !status.is_success() {
            let mut body = upstream_response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| body.is_char_boundary(*i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            tracing::warn!(
                status = %status,
                provider = %params.provider_id,
                body = %body,
                "Provider returned error"
            );
            return Err(AdapterError::Status {
                status: status.as_u16(),
                body,
            });
        }

        if streaming {
            Ok(Completion::Stream(decode_chunks(
                upstream_response.bytes_stream(),
            )))
        } else {
            let value: Value = upstream_response
                .json()
                .await
                .map_err(|e| AdapterError::Decode(e.to_string()))?;
            Ok(Completion::Response(value))
        }
    }
}

/// Turn an SSE byte stream into a stream of JSON chunks, stopping at `[DONE]`.
fn decode_chunks<S>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut decoder = SseDecoder::new();
        futures::pin_mut!(body);

        while let Some(chunk) = body.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(AdapterError::Stream(e.to_string()));
                    return;
                }
            };
            for event in decoder.push(&bytes) {
                match event {
                    SseEvent::Done => return,
                    SseEvent::Data(data) => {
                        if let Some(item) = parse_chunk(&data) {
                            let failed = item.is_err();
                            yield item;
                            if failed {
                                return;
                            }
                        }
                    }
                }
            }
        }

        for event in decoder.finish() {
            match event {
                SseEvent::Done => return,
                SseEvent::Data(data) => {
                    if let Some(item) = parse_chunk(&data) {
                        let failed = item.is_err();
                        yield item;
                        if failed {
                            return;
                        }
                    }
                }
            }
        }
    })
}

/// Parse one `data:` payload. Malformed JSON is skipped; an embedded `error`
/// object ends the stream.
fn parse_chunk(data: &str) -> Option<Result<Value, AdapterError>> {
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping malformed SSE payload");
            return None;
        }
    };

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Some(Err(AdapterError::Stream(message)));
    }

    Some(Ok(value))
}
