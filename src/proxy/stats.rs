//! Usage stats endpoint types, time range resolution, and handler.

use std::collections::BTreeMap;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::server::AppState;
use crate::error::Error;
use crate::storage::{self, stats::StatsFilter};

/// Query parameters for GET /usage/stats.
#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub range: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub endpoint: Option<String>,
    pub group_by: Option<String>,
    /// Row cap for `group_by=client`.
    pub limit: Option<u32>,
}

const DEFAULT_CLIENT_LIMIT: u32 = 10;
const MAX_CLIENT_LIMIT: u32 = 1000;

/// Breakdown requested through `group_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Model,
    Client,
}

impl GroupBy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "model" => Some(Self::Model),
            "client" => Some(Self::Client),
            _ => None,
        }
    }
}

/// Preset time range options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePreset {
    Last1h,
    Last24h,
    Last7d,
    Last30d,
}

impl RangePreset {
    /// Parse a preset string into a RangePreset.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "last_1h" => Some(Self::Last1h),
            "last_24h" => Some(Self::Last24h),
            "last_7d" => Some(Self::Last7d),
            "last_30d" => Some(Self::Last30d),
            _ => None,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Self::Last1h => Duration::hours(1),
            Self::Last24h => Duration::hours(24),
            Self::Last7d => Duration::days(7),
            Self::Last30d => Duration::days(30),
        }
    }
}

/// Resolve the time range from query parameters.
///
/// Explicit `since`/`until` win over `range`; with neither, the last 24
/// hours are used.
pub fn resolve_time_range(
    range: Option<&str>,
    since: Option<&str>,
    until: Option<&str>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), Error> {
    let now = Utc::now();

    let since_dt = if let Some(s) = since {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::InvalidRequest(format!("Invalid 'since' timestamp: {}", e)))?
    } else if let Some(r) = range {
        let preset = RangePreset::parse(r).ok_or_else(|| {
            Error::InvalidRequest(format!(
                "Invalid range '{}'. Supported: last_1h, last_24h, last_7d, last_30d",
                r
            ))
        })?;
        now - preset.duration()
    } else {
        now - RangePreset::Last24h.duration()
    };

    let until_dt = if let Some(u) = until {
        DateTime::parse_from_rfc3339(u)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::InvalidRequest(format!("Invalid 'until' timestamp: {}", e)))?
    } else {
        now
    };

    if since_dt > until_dt {
        return Err(Error::InvalidRequest(
            "'since' must not be later than 'until'".to_string(),
        ));
    }

    Ok((since_dt, until_dt))
}

/// Request, token and latency totals for one slice of traffic.
#[derive(Debug, Serialize, PartialEq)]
pub struct UsageTotals {
    pub requests: i64,
    pub success: i64,
    pub error: i64,
    pub streaming: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub avg_response_time_ms: f64,
}

impl From<&storage::stats::AggregateRow> for UsageTotals {
    fn from(row: &storage::stats::AggregateRow) -> Self {
        let input = row.total_input_tokens as i64;
        let output = row.total_output_tokens as i64;
        Self {
            requests: row.total_requests,
            success: row.success_count,
            error: row.error_count,
            streaming: row.streaming_count,
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            avg_response_time_ms: row.avg_response_time_ms,
        }
    }
}

impl From<&storage::stats::ModelRow> for UsageTotals {
    fn from(row: &storage::stats::ModelRow) -> Self {
        let input = row.total_input_tokens as i64;
        let output = row.total_output_tokens as i64;
        Self {
            requests: row.total_requests,
            success: row.success_count,
            error: row.error_count,
            streaming: row.streaming_count,
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            avg_response_time_ms: row.avg_response_time_ms,
        }
    }
}

impl From<&storage::stats::ClientRow> for UsageTotals {
    fn from(row: &storage::stats::ClientRow) -> Self {
        let input = row.total_input_tokens as i64;
        let output = row.total_output_tokens as i64;
        Self {
            requests: row.total_requests,
            success: row.success_count,
            error: row.error_count,
            streaming: row.streaming_count,
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            avg_response_time_ms: row.avg_response_time_ms,
        }
    }
}

/// One entry of the per-client leaderboard.
#[derive(Debug, Serialize)]
pub struct ClientUsage {
    pub client_ip: String,
    pub last_request: String,
    #[serde(flatten)]
    pub totals: UsageTotals,
}

/// Top-level stats response.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub since: String,
    pub until: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub totals: UsageTotals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<BTreeMap<String, UsageTotals>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<ClientUsage>>,
}

/// Handle GET /usage/stats -- aggregate usage statistics.
pub async fn stats_handler(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Result<impl IntoResponse, Error> {
    let pool = state
        .db
        .as_ref()
        .ok_or_else(|| Error::NotConfigured("usage database".to_string()))?;

    let (since_dt, until_dt) = resolve_time_range(
        params.range.as_deref(),
        params.since.as_deref(),
        params.until.as_deref(),
    )?;
    let since = storage::format_timestamp(since_dt);
    let until = storage::format_timestamp(until_dt);

    let group_by = params
        .group_by
        .as_deref()
        .map(|g| {
            GroupBy::parse(g).ok_or_else(|| {
                Error::InvalidRequest(
                    "Invalid group_by value. Supported: 'model', 'client'".to_string(),
                )
            })
        })
        .transpose()?;

    let limit = params.limit.unwrap_or(DEFAULT_CLIENT_LIMIT);
    if limit == 0 || limit > MAX_CLIENT_LIMIT {
        return Err(Error::InvalidRequest(format!(
            "Invalid limit {}. Must be between 1 and {}",
            limit, MAX_CLIENT_LIMIT
        )));
    }

    let filter = StatsFilter {
        model: params.model.as_deref(),
        provider: params.provider.as_deref(),
        endpoint: params.endpoint.as_deref(),
    };

    tracing::debug!(since = %since, until = %until, ?filter, "Stats query");

    let row = storage::stats::query_aggregate(pool, &since, &until, &filter).await?;

    let mut models = None;
    let mut clients = None;
    match group_by {
        Some(GroupBy::Model) => {
            let rows =
                storage::stats::query_grouped_by_model(pool, &since, &until, &filter).await?;
            models = Some(
                rows.iter()
                    .map(|r| (r.public_name.clone(), UsageTotals::from(r)))
                    .collect(),
            );
        }
        Some(GroupBy::Client) => {
            let rows =
                storage::stats::query_grouped_by_client(pool, &since, &until, &filter, limit)
                    .await?;
            clients = Some(
                rows.iter()
                    .map(|r| ClientUsage {
                        client_ip: r.client_ip.clone(),
                        last_request: r.last_request.clone(),
                        totals: UsageTotals::from(r),
                    })
                    .collect(),
            );
        }
        None => {}
    }

    let message = (row.total_requests == 0)
        .then(|| "No requests found in the specified time range".to_string());

    Ok(Json(StatsResponse {
        since,
        until,
        message,
        totals: UsageTotals::from(&row),
        models,
        clients,
    }))
}
