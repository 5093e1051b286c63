//! API handlers.
//!
//! Input is validated before the tool is touched, so a malformed request
//! gets a 400 even while the tool is unavailable.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::filter::{where_clause, FilterError, Filters};
use crate::manifest::{DbtCli, SemanticManifest};
use crate::tool::MetricQuery;

use super::error::ApiError;
use super::server::SharedState;

type ApiResult = Result<Json<Value>, ApiError>;

// ============================================================================
// Request types
// ============================================================================

/// Body of `/api/query` and `/api/sql`.
#[derive(Debug, Default, Deserialize)]
pub struct QueryRequest {
    /// Metric names to query.
    pub metrics: Vec<String>,
    /// Dimensions to group by.
    #[serde(default)]
    pub dimensions: Vec<String>,
    /// Filter mapping, as an object or a JSON string holding one.
    #[serde(default)]
    pub filters: Option<Value>,
    /// Extra `where` expression, combined with the filters.
    #[serde(default, rename = "where")]
    pub where_clause: Option<String>,
    #[serde(default)]
    pub time_grain: Option<String>,
    /// Row limit; the configured default applies when absent.
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateDimensionsRequest {
    pub metric_name: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

fn parse_filters(raw: Option<Value>) -> Result<Filters, FilterError> {
    match raw {
        None => Ok(Filters::new()),
        Some(Value::String(text)) => Filters::parse_str(&text),
        Some(value) => Filters::from_json(value),
    }
}

/// Turn a request into a tool query plus the parsed filters.
fn build_query(
    state: &SharedState,
    request: QueryRequest,
) -> Result<(MetricQuery, Filters), ApiError> {
    if request.metrics.iter().all(|m| m.trim().is_empty()) {
        return Err(ApiError::BadRequest(
            "at least one metric is required".to_string(),
        ));
    }

    let filters = parse_filters(request.filters)?;
    let generated = where_clause(&filters, state.query.filter_style);
    let explicit = request.where_clause.filter(|w| !w.trim().is_empty());
    let combined = match (explicit, generated) {
        // Parenthesised so an OR in the caller's clause stays inside it
        (Some(w), Some(g)) => Some(format!("({}) AND {}", w, g)),
        (w, g) => w.or(g),
    };

    let query = MetricQuery::new(request.metrics)
        .dimensions(request.dimensions)
        .filter(combined)
        .time_grain(request.time_grain)
        .limit(request.limit.or(state.query.default_limit));
    Ok((query, filters))
}

fn timestamp() -> String {
    chrono::Local::now().to_rfc3339()
}

fn metric_summary(record: &Value) -> Value {
    json!({
        "name": record.get("name"),
        "label": record.get("label"),
        "description": record.get("description"),
        "type": record.get("type"),
    })
}

fn counted(key: &str, records: Vec<Value>) -> Value {
    json!({ "count": records.len(), key: records })
}

// ============================================================================
// Metrics
// ============================================================================

/// GET /api/metrics - List all metrics
pub async fn list_metrics(State(state): State<SharedState>) -> ApiResult {
    state.client.ensure_ready().await?;
    let records = state.client.list_metrics().await?;
    let metrics: Vec<Value> = records.iter().map(metric_summary).collect();
    Ok(Json(counted("metrics", metrics)))
}

/// GET /api/metrics/{name} - One metric from the metric list
pub async fn get_metric(State(state): State<SharedState>, Path(name): Path<String>) -> ApiResult {
    state.client.ensure_ready().await?;
    let records = state.client.list_metrics().await?;

    let metric = records
        .into_iter()
        .find(|m| m.get("name").and_then(Value::as_str) == Some(name.as_str()))
        .ok_or_else(|| ApiError::NotFound(format!("Metric '{}' not found", name)))?;

    let mut summary = metric_summary(&metric);
    summary["details"] = metric;
    Ok(Json(summary))
}

/// POST /api/metrics/validate-dimensions - Check dimensions against a metric
pub async fn validate_dimensions(
    State(state): State<SharedState>,
    payload: Result<Json<ValidateDimensionsRequest>, JsonRejection>,
) -> ApiResult {
    let request = body(payload)?;
    if request.metric_name.trim().is_empty() {
        return Err(ApiError::BadRequest("metric_name is required".to_string()));
    }

    state.client.ensure_ready().await?;
    let response = state
        .client
        .validate_dimensions(&request.metric_name, &request.dimensions)
        .await?;

    Ok(Json(json!({
        "metric_name": request.metric_name,
        "dimensions": request.dimensions,
        "result": response.to_json(),
    })))
}

/// POST /api/query - Query metrics
pub async fn query_metrics(
    State(state): State<SharedState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> ApiResult {
    let (query, filters) = build_query(&state, body(payload)?)?;

    state.client.ensure_ready().await?;
    let response = state.client.query_metrics(&query).await?;

    Ok(Json(json!({
        "metrics": query.metrics,
        "dimensions": query.dimensions,
        "filters": filters,
        "where": query.where_clause,
        "limit": query.limit,
        "data": response.to_json(),
        "timestamp": timestamp(),
    })))
}

/// POST /api/sql - Compiled SQL for a query
pub async fn compiled_sql(
    State(state): State<SharedState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> ApiResult {
    let (query, _) = build_query(&state, body(payload)?)?;

    state.client.ensure_ready().await?;
    let sql = state.client.compiled_sql(&query).await?;

    Ok(Json(json!({
        "sql": sql,
        "metrics": query.metrics,
        "dimensions": query.dimensions,
        "where": query.where_clause,
        "timestamp": timestamp(),
    })))
}

/// GET /api/semantic-models - List semantic models
pub async fn list_semantic_models(State(state): State<SharedState>) -> ApiResult {
    state.client.ensure_ready().await?;
    let models = state.client.list_semantic_models().await?;
    Ok(Json(counted("semantic_models", models)))
}

// ============================================================================
// dbt catalog
// ============================================================================

/// GET /api/models - List dbt models
pub async fn list_models(State(state): State<SharedState>) -> ApiResult {
    state.client.ensure_ready().await?;
    let models = state.client.list_models().await?;
    Ok(Json(counted("models", models)))
}

/// GET /api/models/{name} - One dbt model
pub async fn get_model(State(state): State<SharedState>, Path(name): Path<String>) -> ApiResult {
    state.client.ensure_ready().await?;
    let response = state.client.get_model(&name).await?;
    if response.records().is_empty() {
        return Err(ApiError::NotFound(format!("Model '{}' not found", name)));
    }
    Ok(Json(response.to_json()))
}

/// GET /api/sources - List dbt sources
pub async fn list_sources(State(state): State<SharedState>) -> ApiResult {
    state.client.ensure_ready().await?;
    let sources = state.client.list_sources().await?;
    Ok(Json(counted("sources", sources)))
}

/// GET /api/lineage/{name} - Lineage of a model
pub async fn get_lineage(State(state): State<SharedState>, Path(name): Path<String>) -> ApiResult {
    state.client.ensure_ready().await?;
    let response = state.client.get_lineage(&name).await?;
    Ok(Json(json!({
        "model": name,
        "lineage": response.to_json(),
    })))
}

/// GET /api/tools - Verbs the tool advertises
pub async fn list_tools(State(state): State<SharedState>) -> ApiResult {
    state.client.ensure_ready().await?;
    let tools = state.client.list_tools().await?;
    Ok(Json(json!({ "count": tools.len(), "tools": tools })))
}

// ============================================================================
// Manifest fallback
// ============================================================================

/// POST /api/parse - Run `dbt parse`
pub async fn parse_project(State(state): State<SharedState>) -> ApiResult {
    let output = DbtCli::from_config(&state.tool).parse().await?;
    Ok(Json(json!({
        "success": output.success,
        "message": "dbt parse completed",
        "stdout": output.stdout,
        "timestamp": timestamp(),
    })))
}

/// GET /api/manifest/metrics - Metrics read from the semantic manifest,
/// parsing the project first when it has none
pub async fn manifest_metrics(State(state): State<SharedState>) -> ApiResult {
    let manifest = SemanticManifest::load_or_parse(&DbtCli::from_config(&state.tool)).await?;
    let metrics = manifest.metrics();
    Ok(Json(json!({
        "count": metrics.len(),
        "metrics": metrics,
        "source": "semantic_manifest",
    })))
}
