//! Aggregate usage queries for the stats endpoint.

use sqlx::{QueryBuilder, Sqlite, SqlitePool};

/// Aggregate statistics for a time range.
#[derive(Debug, sqlx::FromRow)]
pub struct AggregateRow {
    pub total_requests: i64,
    pub total_input_tokens: f64,
    pub total_output_tokens: f64,
    pub avg_response_time_ms: f64,
    pub success_count: i64,
    pub error_count: i64,
    pub streaming_count: i64,
}

/// Per-model statistics for a time range.
#[derive(Debug, sqlx::FromRow)]
pub struct ModelRow {
    pub public_name: String,
    pub total_requests: i64,
    pub total_input_tokens: f64,
    pub total_output_tokens: f64,
    pub avg_response_time_ms: f64,
    pub success_count: i64,
    pub error_count: i64,
    pub streaming_count: i64,
}

/// Per-client statistics for a time range.
#[derive(Debug, sqlx::FromRow)]
pub struct ClientRow {
    pub client_ip: String,
    pub total_requests: i64,
    pub total_input_tokens: f64,
    pub total_output_tokens: f64,
    pub avg_response_time_ms: f64,
    pub success_count: i64,
    pub error_count: i64,
    pub streaming_count: i64,
    pub last_request: String,
}

/// Optional narrowing applied to every stats query.
#[derive(Debug, Clone, Default)]
pub struct StatsFilter<'a> {
    pub model: Option<&'a str>,
    pub provider: Option<&'a str>,
    pub endpoint: Option<&'a str>,
}

const AGGREGATE_COLUMNS: &str = "COUNT(*) as total_requests, \
     TOTAL(input_tokens) as total_input_tokens, \
     TOTAL(output_tokens) as total_output_tokens, \
     COALESCE(AVG(response_time_ms), 0.0) as avg_response_time_ms, \
     COUNT(CASE WHEN status = 'success' THEN 1 END) as success_count, \
     COUNT(CASE WHEN status = 'error' THEN 1 END) as error_count, \
     COUNT(CASE WHEN streaming = 1 THEN 1 END) as streaming_count";

fn push_where<'q>(
    builder: &mut QueryBuilder<'q, Sqlite>,
    since: &'q str,
    until: &'q str,
    filter: &StatsFilter<'q>,
) {
    builder
        .push(" FROM usage_records WHERE timestamp >= ")
        .push_bind(since)
        .push(" AND timestamp <= ")
        .push_bind(until);

    if let Some(model) = filter.model {
        builder
            .push(" AND LOWER(public_name) = LOWER(")
            .push_bind(model)
            .push(")");
    }
    if let Some(provider) = filter.provider {
        builder
            .push(" AND LOWER(provider_kind) = LOWER(")
            .push_bind(provider)
            .push(")");
    }
    if let Some(endpoint) = filter.endpoint {
        builder.push(" AND endpoint = ").push_bind(endpoint);
    }
}

/// Query aggregate statistics for a time range.
///
/// Uses `TOTAL()` for token sums (0.0 instead of NULL on empty ranges).
pub async fn query_aggregate(
    pool: &SqlitePool,
    since: &str,
    until: &str,
    filter: &StatsFilter<'_>,
) -> Result<AggregateRow, sqlx::Error> {
    let mut builder = QueryBuilder::<Sqlite>::new("SELECT ");
    builder.push(AGGREGATE_COLUMNS);
    push_where(&mut builder, since, until, filter);

    builder
        .build_query_as::<AggregateRow>()
        .fetch_one(pool)
        .await
}

/// Query per-model statistics for a time range, ordered by model name.
pub async fn query_grouped_by_model(
    pool: &SqlitePool,
    since: &str,
    until: &str,
    filter: &StatsFilter<'_>,
) -> Result<Vec<ModelRow>, sqlx::Error> {
    let mut builder = QueryBuilder::<Sqlite>::new("SELECT public_name, ");
    builder.push(AGGREGATE_COLUMNS);
    push_where(&mut builder, since, until, filter);
    builder.push(" GROUP BY public_name ORDER BY public_name");

    builder
        .build_query_as::<ModelRow>()
        .fetch_all(pool)
        .await
}

/// Query per-client statistics for a time range.
///
/// Heaviest token consumers first, at most `limit` rows.
pub async fn query_grouped_by_client(
    pool: &SqlitePool,
    since: &str,
    until: &str,
    filter: &StatsFilter<'_>,
    limit: u32,
) -> Result<Vec<ClientRow>, sqlx::Error> {
    let mut builder = QueryBuilder::<Sqlite>::new("SELECT client_ip, MAX(timestamp) as last_request, ");
    builder.push(AGGREGATE_COLUMNS);
    push_where(&mut builder, since, until, filter);
    builder
        .push(" GROUP BY client_ip ORDER BY TOTAL(input_tokens) + TOTAL(output_tokens) DESC, client_ip LIMIT ")
        .push_bind(i64::from(limit));

    builder
        .build_query_as::<ClientRow>()
        .fetch_all(pool)
        .await
}
