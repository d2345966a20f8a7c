//! Usage events and the sinks that persist them.
//!
//! Exactly one [`UsageEvent`] is produced for every request that reached a
//! provider. Sinks must not block the request path: writes are spawned and
//! failures only logged.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Success,
    Error,
}

impl UsageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageStatus::Success => "success",
            UsageStatus::Error => "error",
        }
    }
}

/// One metered request.
///
/// All fields are owned so the event can cross into a spawned task.
#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub endpoint: String,
    pub service_id: String,
    pub provider_kind: String,
    /// Configured upstream model name.
    pub model_name: String,
    /// Name the client addressed the model by.
    pub public_name: String,
    pub streaming: bool,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub response_time_ms: u64,
    pub status: UsageStatus,
    pub error_kind: Option<ErrorKind>,
    /// Raw failure text, for operators only.
    pub error_message: Option<String>,
}

impl UsageEvent {
    /// Insert this event into the database.
    pub async fn insert(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO usage_records (
                id, timestamp, client_ip, endpoint, service_id, provider_kind,
                model_name, public_name, streaming,
                input_tokens, output_tokens, total_tokens,
                response_time_ms, status, error_kind, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(self.id.to_string())
        .bind(super::format_timestamp(self.timestamp))
        .bind(&self.client_ip)
        .bind(&self.endpoint)
        .bind(&self.service_id)
        .bind(&self.provider_kind)
        .bind(&self.model_name)
        .bind(&self.public_name)
        .bind(self.streaming)
        .bind(i64::from(self.input_tokens))
        .bind(i64::from(self.output_tokens))
        .bind(i64::from(self.total_tokens))
        .bind(i64::try_from(self.response_time_ms).unwrap_or(i64::MAX))
        .bind(self.status.as_str())
        .bind(self.error_kind.map(|k| k.as_str()))
        .bind(self.error_message.as_deref())
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// Delete usage records stamped before `cutoff`. Returns the number removed.
pub async fn purge_before(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM usage_records WHERE timestamp < ?")
        .bind(super::format_timestamp(cutoff))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Receives usage events. Implementations must return promptly.
pub trait UsageSink: Send + Sync {
    fn record(&self, event: UsageEvent);
}

/// Writes events to the `usage_records` table in the background.
#[derive(Debug, Clone)]
pub struct SqliteUsageSink {
    pool: SqlitePool,
}

impl SqliteUsageSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl UsageSink for SqliteUsageSink {
    fn record(&self, event: UsageEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(id = %event.id, "No runtime available; usage event dropped");
            return;
        };
        let pool = self.pool.clone();
        handle.spawn(async move {
            if let Err(e) = event.insert(&pool).await {
                tracing::warn!(
                    id = %event.id,
                    error = %e,
                    "Failed to write usage record to database"
                );
            }
        });
    }
}

/// Emits each event as a structured log line. Used when no database is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn record(&self, event: UsageEvent) {
        tracing::info!(
            target: "llm_bridge::usage",
            id = %event.id,
            client_ip = %event.client_ip,
            endpoint = %event.endpoint,
            service = %event.service_id,
            model = %event.public_name,
            streaming = event.streaming,
            input_tokens = event.input_tokens,
            output_tokens = event.output_tokens,
            response_time_ms = event.response_time_ms,
            status = event.status.as_str(),
            error_kind = event.error_kind.map(|k| k.as_str()),
            "usage"
        );
    }
}
