//! Recognised verbs and typed helpers for them.
//!
//! Verb spelling differs between tool releases (`list_metrics` in one,
//! `metricflow.list_metrics` in another), so the wire name of each verb
//! comes from [`VerbNames`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::client::ToolClient;
use super::error::CallResult;
use super::session::Response;

/// Which part of the tool a verb belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbGroup {
    /// MetricFlow semantic-layer verbs.
    Metrics,
    /// dbt project catalog verbs.
    Catalog,
}

/// A verb the client knows how to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    ListMetrics,
    QueryMetrics,
    CompiledSql,
    GetMetric,
    ValidateDimensions,
    ListSemanticModels,
    ListModels,
    GetModel,
    ListSources,
    GetLineage,
}

impl Verb {
    pub const ALL: [Verb; 10] = [
        Verb::ListMetrics,
        Verb::QueryMetrics,
        Verb::CompiledSql,
        Verb::GetMetric,
        Verb::ValidateDimensions,
        Verb::ListSemanticModels,
        Verb::ListModels,
        Verb::GetModel,
        Verb::ListSources,
        Verb::GetLineage,
    ];

    /// Unqualified name of the verb.
    pub fn name(&self) -> &'static str {
        match self {
            Verb::ListMetrics => "list_metrics",
            Verb::QueryMetrics => "query_metrics",
            Verb::CompiledSql => "get_metrics_compiled_sql",
            Verb::GetMetric => "get_metric",
            Verb::ValidateDimensions => "validate_dimensions",
            Verb::ListSemanticModels => "list_semantic_models",
            Verb::ListModels => "list_models",
            Verb::GetModel => "get_model",
            Verb::ListSources => "list_sources",
            Verb::GetLineage => "get_lineage",
        }
    }

    pub fn group(&self) -> VerbGroup {
        match self {
            Verb::ListModels | Verb::GetModel | Verb::ListSources | Verb::GetLineage => {
                VerbGroup::Catalog
            }
            _ => VerbGroup::Metrics,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Wire naming for verbs.
///
/// ```toml
/// [verbs]
/// metrics_namespace = "metricflow"
/// catalog_namespace = "dbt"
///
/// [verbs.overrides]
/// get_metrics_compiled_sql = "metricflow.generate_sql"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct VerbNames {
    /// Prefix for metric verbs, empty for none.
    pub metrics_namespace: String,
    /// Prefix for catalog verbs, empty for none.
    pub catalog_namespace: String,
    /// Full wire names keyed by unqualified verb name.
    pub overrides: BTreeMap<String, String>,
}

impl VerbNames {
    /// Naming used by MCP servers that namespace their tools.
    pub fn namespaced() -> Self {
        Self {
            metrics_namespace: "metricflow".to_string(),
            catalog_namespace: "dbt".to_string(),
            overrides: BTreeMap::from([(
                Verb::CompiledSql.name().to_string(),
                "metricflow.generate_sql".to_string(),
            )]),
        }
    }

    /// Name to send for `verb`.
    pub fn resolve(&self, verb: Verb) -> String {
        if let Some(name) = self.overrides.get(verb.name()) {
            return name.clone();
        }
        let namespace = match verb.group() {
            VerbGroup::Metrics => &self.metrics_namespace,
            VerbGroup::Catalog => &self.catalog_namespace,
        };
        if namespace.is_empty() {
            verb.name().to_string()
        } else {
            format!("{}.{}", namespace, verb.name())
        }
    }
}

/// Parameters for querying metrics or compiling their SQL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub metrics: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default, rename = "where")]
    pub where_clause: Option<String>,
    #[serde(default)]
    pub time_grain: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl MetricQuery {
    pub fn new<I, S>(metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            metrics: metrics.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn dimensions<I, S>(mut self, dimensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dimensions = dimensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, where_clause: Option<String>) -> Self {
        self.where_clause = where_clause.filter(|w| !w.trim().is_empty());
        self
    }

    pub fn time_grain(mut self, grain: Option<String>) -> Self {
        self.time_grain = grain;
        self
    }

    pub fn limit(mut self, limit: Option<u32>) -> Self {
        self.limit = limit;
        self
    }

    /// Request parameters. Absent values are omitted rather than sent as null.
    pub fn to_params(&self, include_limit: bool) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("metrics".to_string(), string_list(&self.metrics));
        if !self.dimensions.is_empty() {
            params.insert("dimensions".to_string(), string_list(&self.dimensions));
        }
        if let Some(where_clause) = &self.where_clause {
            params.insert("where".to_string(), Value::String(where_clause.clone()));
        }
        if let Some(grain) = &self.time_grain {
            params.insert("time_grain".to_string(), Value::String(grain.clone()));
        }
        if include_limit {
            if let Some(limit) = self.limit {
                params.insert("limit".to_string(), Value::from(limit));
            }
        }
        params
    }
}

fn string_list(items: &[String]) -> Value {
    Value::Array(items.iter().cloned().map(Value::String).collect())
}

fn single(key: &str, value: &str) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert(key.to_string(), Value::String(value.to_string()));
    params
}

/// Typed wrappers over [`ToolClient::call`].
impl ToolClient {
    async fn call_verb(&self, verb: Verb, params: Map<String, Value>) -> CallResult<Response> {
        let name = self.verbs().resolve(verb);
        self.call(&name, params).await
    }

    pub async fn list_metrics(&self) -> CallResult<Vec<Value>> {
        Ok(self.call_verb(Verb::ListMetrics, Map::new()).await?.records())
    }

    pub async fn query_metrics(&self, query: &MetricQuery) -> CallResult<Response> {
        self.call_verb(Verb::QueryMetrics, query.to_params(true)).await
    }

    /// SQL the tool would run for `query`. The limit is not sent.
    pub async fn compiled_sql(&self, query: &MetricQuery) -> CallResult<String> {
        let response = self
            .call_verb(Verb::CompiledSql, query.to_params(false))
            .await?;
        Ok(response.text())
    }

    pub async fn get_metric(&self, metric_name: &str) -> CallResult<Response> {
        self.call_verb(Verb::GetMetric, single("metric_name", metric_name))
            .await
    }

    pub async fn validate_dimensions(
        &self,
        metric_name: &str,
        dimensions: &[String],
    ) -> CallResult<Response> {
        let mut params = single("metric_name", metric_name);
        params.insert("dimensions".to_string(), string_list(dimensions));
        self.call_verb(Verb::ValidateDimensions, params).await
    }

    pub async fn list_semantic_models(&self) -> CallResult<Vec<Value>> {
        Ok(self
            .call_verb(Verb::ListSemanticModels, Map::new())
            .await?
            .records())
    }

    pub async fn list_models(&self) -> CallResult<Vec<Value>> {
        Ok(self.call_verb(Verb::ListModels, Map::new()).await?.records())
    }

    pub async fn get_model(&self, model_name: &str) -> CallResult<Response> {
        self.call_verb(Verb::GetModel, single("model_name", model_name))
            .await
    }

    pub async fn list_sources(&self) -> CallResult<Vec<Value>> {
        Ok(self.call_verb(Verb::ListSources, Map::new()).await?.records())
    }

    pub async fn get_lineage(&self, model_name: &str) -> CallResult<Response> {
        self.call_verb(Verb::GetLineage, single("model_name", model_name))
            .await
    }
}
