//! HTTP proxy server module.
//!
//! This module provides the OpenAI-compatible HTTP API, the routing
//! pipeline behind it, and the health and error machinery it relies on.

pub mod classify;
pub mod dispatch;
mod handlers;
pub mod health;
mod server;
pub mod stats;
pub mod types;

pub use classify::{classify, ErrorClassification};
pub use dispatch::{Dispatched, RequestContext, RequestRouter, SseBody};
pub use health::{Admission, HealthPolicy, HealthStatus, HealthTracker, ServiceHealth};
pub use server::{build_router, create_router, run_server, AppState, RequestId, REQUEST_ID_HEADER};
pub use types::{ensure_stream_options, ChatCompletionRequest, CompletionRequest, Message, StreamOptions};
