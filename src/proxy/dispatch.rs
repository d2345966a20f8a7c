//! Request routing pipeline.
//!
//! A request moves through validation, model resolution, the endpoint and
//! health gates, and finally one adapter call. Every request that reaches
//! the adapter is metered by a [`UsageMeter`], whose `Drop` impl guarantees
//! exactly one usage event even when the client goes away mid-flight.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use uuid::Uuid;

use super::classify::classify;
use super::health::{Admission, HealthTracker};
use super::types::{rewrite_model, ChatCompletionRequest, ModelList, ModelObject, Usage};
use crate::adapter::{AdapterError, ChunkStream, Completion, CompletionAdapter, CompletionParams};
use crate::error::{Error, ErrorKind};
use crate::registry::{endpoint, ConfigRegistry, ResolvedProvider};
use crate::storage::{UsageEvent, UsageSink, UsageStatus};

/// Server-sent event body handed to the HTTP layer.
pub type SseBody = BoxStream<'static, Result<Bytes, Infallible>>;

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Where a request came from.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    /// Logical endpoint the request arrived on.
    pub endpoint: String,
    pub client_ip: String,
}

/// What the router produced for a request.
pub enum Dispatched {
    Complete(Value),
    Stream(SseBody),
}

impl std::fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatched::Complete(v) => f.debug_tuple("Complete").field(v).finish(),
            Dispatched::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Orchestrates one request from validation to usage logging.
pub struct RequestRouter {
    registry: Arc<ConfigRegistry>,
    health: Arc<HealthTracker>,
    adapter: Arc<dyn CompletionAdapter>,
    usage: Arc<dyn UsageSink>,
    upstream_timeout: Duration,
}

impl RequestRouter {
    pub fn new(
        registry: Arc<ConfigRegistry>,
        health: Arc<HealthTracker>,
        adapter: Arc<dyn CompletionAdapter>,
        usage: Arc<dyn UsageSink>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            health,
            adapter,
            usage,
            upstream_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConfigRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// Route one chat completion request.
    pub async fn route(
        &self,
        ctx: &RequestContext,
        request: ChatCompletionRequest,
    ) -> Result<Dispatched, Error> {
        let (provider, admission) = self.admit(&ctx.endpoint, &request)?;
        let params = CompletionParams::new(&provider, request);
        let streaming = params.is_streaming();

        tracing::info!(
            request_id = %ctx.request_id,
            endpoint = %ctx.endpoint,
            model = %provider.public_name(),
            service = %provider.service_id,
            streaming,
            probe = admission == Admission::Probe,
            "Dispatching request"
        );

        let mut meter = UsageMeter::start(
            self.usage.clone(),
            self.health.clone(),
            ctx,
            &provider,
            streaming,
            admission == Admission::Probe,
        );

        let completion =
            match tokio::time::timeout(self.upstream_timeout, self.adapter.complete(params)).await {
                Ok(Ok(completion)) => completion,
                Ok(Err(e)) => return Err(meter.fail(&e)),
                Err(_) => return Err(meter.fail(&self.timeout_error())),
            };

        match (completion, streaming) {
            (Completion::Response(mut response), false) => {
                rewrite_model(&mut response, provider.public_name());
                meter.observe(&response);
                meter.succeed();
                Ok(Dispatched::Complete(response))
            }
            (Completion::Response(response), true) => {
                // Adapter answered a streaming request in one piece; relay it as one chunk
                let chunks: ChunkStream = Box::pin(futures::stream::iter([Ok(response)]));
                Ok(Dispatched::Stream(relay(meter, chunks, self.upstream_timeout)))
            }
            (Completion::Stream(chunks), true) => {
                Ok(Dispatched::Stream(relay(meter, chunks, self.upstream_timeout)))
            }
            (Completion::Stream(_), false) => Err(meter.fail(&AdapterError::Decode(
                "provider streamed a non-streaming request".to_string(),
            ))),
        }
    }

    /// Validation, resolution and both gates. Nothing here is metered.
    fn admit(
        &self,
        endpoint_id: &str,
        request: &ChatCompletionRequest,
    ) -> Result<(Arc<ResolvedProvider>, Admission), Error> {
        let model = request
            .model_name()
            .ok_or_else(|| Error::InvalidRequest("Model is required".to_string()))?;
        if request.messages.is_empty() {
            return Err(Error::InvalidRequest(
                "At least one message is required".to_string(),
            ));
        }

        // One snapshot for the whole request
        let snapshot = self.registry.snapshot();
        let provider = snapshot.lookup(model).ok_or_else(|| Error::UnknownModel {
            model: model.to_string(),
        })?;

        if !endpoint::is_available(&provider.config, endpoint_id) {
            tracing::debug!(
                model = %model,
                endpoint = %endpoint_id,
                "Model not exposed on this endpoint"
            );
            return Err(Error::EndpointUnavailable {
                model: model.to_string(),
                endpoint: endpoint_id.to_string(),
                alternatives: endpoint::alternative_endpoints(&provider.config, endpoint_id),
            });
        }

        match self.health.admit(&provider.service_id) {
            Admission::Rejected {
                consecutive_failures,
                last_error,
            } => {
                tracing::warn!(
                    service = %provider.service_id,
                    consecutive_failures,
                    "Rejecting request: service unhealthy"
                );
                Err(Error::CircuitOpen {
                    service: provider.kind().as_str().to_string(),
                    model: provider.public_name().to_string(),
                    consecutive_failures,
                    last_error: last_error.map(|e| e.kind.as_str().to_string()),
                })
            }
            admission => Ok((provider, admission)),
        }
    }

    fn timeout_error(&self) -> AdapterError {
        AdapterError::Timeout(format!(
            "no response within {}s",
            self.upstream_timeout.as_secs()
        ))
    }

    /// Models exposed on `endpoint_id`, ordered by id.
    pub fn list_models(&self, endpoint_id: &str) -> ModelList {
        let snapshot = self.registry.snapshot();
        let created = snapshot.built_at().timestamp();

        let data = snapshot
            .iter()
            .filter(|p| endpoint::is_available(&p.config, endpoint_id))
            .map(|p| ModelObject {
                id: p.public_name().to_string(),
                object: "model",
                created,
                owned_by: p.kind().as_str().to_string(),
                root: p.config.model_name.clone(),
            })
            .collect();

        ModelList {
            object: "list",
            data,
        }
    }
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("registry", &self.registry)
            .field("health", &self.health)
            .field("upstream_timeout", &self.upstream_timeout)
            .finish()
    }
}

/// Forward adapter chunks as SSE frames.
///
/// The meter moves into the generator, so however the generator ends
/// (exhausted, failed, or dropped by a disconnecting client) it is finalized.
fn relay(meter: UsageMeter, chunks: ChunkStream, idle_timeout: Duration) -> SseBody {
    Box::pin(async_stream::stream! {
        let mut meter = meter;
        let public_name = meter.model.clone();
        let chunks = chunks.timeout(idle_timeout);
        futures::pin_mut!(chunks);

        loop {
            match chunks.next().await {
                Some(Ok(Ok(mut chunk))) => {
                    rewrite_model(&mut chunk, &public_name);
                    meter.observe(&chunk);
                    meter.chunks += 1;
                    yield Ok(sse_frame(&chunk));
                }
                Some(Ok(Err(e))) => {
                    let error = meter.fail(&e);
                    yield Ok(sse_frame(&error.body()));
                    return;
                }
                Some(Err(_elapsed)) => {
                    let error = meter.fail(&AdapterError::Timeout(format!(
                        "no chunk within {}s",
                        idle_timeout.as_secs()
                    )));
                    yield Ok(sse_frame(&error.body()));
                    return;
                }
                None => {
                    meter.succeed();
                    yield Ok(Bytes::from_static(DONE_FRAME));
                    return;
                }
            }
        }
    })
}

fn sse_frame(payload: &Value) -> Bytes {
    Bytes::from(format!("data: {}\n\n", payload))
}

// ── Usage metering ───────────────────────────────────────────────────

/// Emits exactly one usage event and one health update per dispatched
/// request.
///
/// `succeed` and `fail` finalize explicitly. If neither is called before the
/// meter is dropped, the client disconnected: the request counts as a
/// success when the provider had already produced output, otherwise as an
/// error with no health verdict (an outstanding probe is released).
struct UsageMeter {
    sink: Arc<dyn UsageSink>,
    health: Arc<HealthTracker>,
    request_id: Uuid,
    endpoint: String,
    client_ip: String,
    service_id: String,
    service: String,
    model_name: String,
    model: String,
    streaming: bool,
    probe: bool,
    started: Instant,
    usage: Usage,
    chunks: usize,
    finished: bool,
}

impl UsageMeter {
    fn start(
        sink: Arc<dyn UsageSink>,
        health: Arc<HealthTracker>,
        ctx: &RequestContext,
        provider: &ResolvedProvider,
        streaming: bool,
        probe: bool,
    ) -> Self {
        Self {
            sink,
            health,
            request_id: ctx.request_id,
            endpoint: ctx.endpoint.clone(),
            client_ip: ctx.client_ip.clone(),
            service_id: provider.service_id.clone(),
            service: provider.kind().as_str().to_string(),
            model_name: provider.config.model_name.clone(),
            model: provider.public_name().to_string(),
            streaming,
            probe,
            started: Instant::now(),
            usage: Usage::default(),
            chunks: 0,
            finished: false,
        }
    }

    /// Remember token counts from a response or chunk that carries them.
    fn observe(&mut self, payload: &Value) {
        if let Some(usage) = Usage::from_payload(payload) {
            self.usage = usage;
        }
    }

    fn succeed(&mut self) {
        if self.finished {
            return;
        }
        self.health.record_success(&self.service_id);
        self.emit(UsageStatus::Success, None, None);
    }

    /// Classify, record the failure, and return the client-facing error.
    fn fail(&mut self, error: &AdapterError) -> Error {
        let classification = classify(error, &self.service, &self.model);
        let raw = error.to_string();

        if !self.finished {
            tracing::warn!(
                request_id = %self.request_id,
                service = %self.service_id,
                model = %self.model,
                error_kind = %classification.kind,
                error = %raw,
                chunks = self.chunks,
                "Upstream request failed"
            );
            self.health
                .record_failure(&self.service_id, classification.kind, &raw);
            self.emit(UsageStatus::Error, Some(classification.kind), Some(raw));
        }

        Error::Upstream {
            classification,
            service: self.service.clone(),
            model: self.model.clone(),
        }
    }

    fn emit(&mut self, status: UsageStatus, error_kind: Option<ErrorKind>, message: Option<String>) {
        self.finished = true;
        let elapsed = self.started.elapsed();
        let input_tokens = self.usage.prompt_tokens;
        let output_tokens = self.usage.completion_tokens;

        tracing::info!(
            request_id = %self.request_id,
            model = %self.model,
            status = status.as_str(),
            input_tokens,
            output_tokens,
            latency_ms = elapsed.as_millis() as u64,
            "Request finished"
        );

        self.sink.record(UsageEvent {
            id: self.request_id,
            timestamp: chrono::Utc::now(),
            client_ip: self.client_ip.clone(),
            endpoint: self.endpoint.clone(),
            service_id: self.service_id.clone(),
            provider_kind: self.service.clone(),
            model_name: self.model_name.clone(),
            public_name: self.model.clone(),
            streaming: self.streaming,
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
            response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            status,
            error_kind,
            error_message: message,
        });
    }
}

impl Drop for UsageMeter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::info!(
            request_id = %self.request_id,
            model = %self.model,
            chunks = self.chunks,
            "Client disconnected before completion"
        );

        if self.chunks > 0 {
            self.health.record_success(&self.service_id);
            self.emit(UsageStatus::Success, None, None);
        } else {
            if self.probe {
                self.health.release_probe(&self.service_id);
            }
            self.emit(
                UsageStatus::Error,
                None,
                Some("client disconnected before the provider responded".to_string()),
            );
        }
    }
}
