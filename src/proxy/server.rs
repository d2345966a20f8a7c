//! HTTP server setup and configuration.

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use sqlx::SqlitePool;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::dispatch::RequestRouter;
use super::handlers;
use super::health::{HealthPolicy, HealthTracker};
use super::stats;
use crate::adapter::HttpCompletionAdapter;
use crate::config::{Config, FileConfigSource};
use crate::registry::ConfigRegistry;
use crate::storage::{self, SqliteUsageSink, TracingUsageSink, UsageSink};

/// Response header: correlation ID (UUID v4).
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request correlation id, inserted by middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub Uuid);

/// Shared application state. One per listening endpoint; everything but
/// `endpoint` is shared between endpoints.
#[derive(Clone)]
pub struct AppState {
    /// Logical endpoint id this listener serves.
    pub endpoint: Arc<str>,
    pub router: Arc<RequestRouter>,
    /// Usage database, when configured.
    pub db: Option<SqlitePool>,
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/models", get(handlers::list_models))
        // Operational endpoints
        .route("/health", get(handlers::health))
        .route("/health/services", get(handlers::service_health))
        .route("/admin/reload", post(handlers::reload))
        .route("/usage/stats", get(stats::stats_handler))
        // State and middleware
        .with_state(state)
        .layer(middleware::from_fn(assign_request_id))
        .layer(TraceLayer::new_for_http())
}

async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(id);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Wire the shared components together from a loaded configuration.
///
/// `config_path` is re-read on every `/admin/reload`.
pub async fn build_router(
    config: &Config,
    config_path: impl Into<PathBuf>,
) -> anyhow::Result<(Arc<RequestRouter>, Option<SqlitePool>)> {
    let registry = Arc::new(ConfigRegistry::load(Arc::new(FileConfigSource::new(
        config_path,
    )))?);
    let health = Arc::new(HealthTracker::new(HealthPolicy::from(&config.health)));
    let adapter = Arc::new(HttpCompletionAdapter::with_connect_timeout(
        Duration::from_secs(10),
    )?);

    let db = match &config.database {
        Some(db_config) => {
            let pool = storage::init_pool(&db_config.path).await?;
            tracing::info!(path = %db_config.path, "Usage database ready");
            if db_config.retention_days > 0 {
                storage::spawn_retention(pool.clone(), db_config.retention_days);
            }
            Some(pool)
        }
        None => None,
    };

    let usage: Arc<dyn UsageSink> = match (&db, config.logging.log_requests) {
        (Some(pool), true) => Arc::new(SqliteUsageSink::new(pool.clone())),
        _ => Arc::new(TracingUsageSink),
    };

    let router = Arc::new(RequestRouter::new(
        registry,
        health,
        adapter,
        usage,
        config.server.upstream_timeout(),
    ));
    Ok((router, db))
}

/// Run one listener per configured endpoint until Ctrl-C.
pub async fn run_server(config: Config, config_path: impl Into<PathBuf>) -> anyhow::Result<()> {
    let (router, db) = build_router(&config, config_path).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut servers = Vec::with_capacity(config.server.endpoints.len());
    for endpoint in &config.server.endpoints {
        let state = AppState {
            endpoint: Arc::from(endpoint.id.as_str()),
            router: router.clone(),
            db: db.clone(),
        };
        let app = create_router(state);

        let listener = tokio::net::TcpListener::bind(&endpoint.listen).await?;
        tracing::info!(
            endpoint = %endpoint.id,
            address = %endpoint.listen,
            "Listening"
        );

        let mut rx = shutdown_rx.clone();
        let endpoint_id = endpoint.id.clone();
        servers.push(tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            })
            .await
            .map_err(|e| anyhow::anyhow!("endpoint '{}' failed: {}", endpoint_id, e))
        }));
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    for result in futures::future::join_all(servers).await {
        result??;
    }

    tracing::info!("All endpoints stopped");
    Ok(())
}
