//! llm-bridge - OpenAI-compatible routing across multiple LLM providers
//!
//! This library provides the core of the bridge: configuration and the
//! hot-reloadable model registry, provider adapters, per-service health
//! tracking, the request router, and usage storage.

pub mod adapter;
pub mod config;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod storage;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
