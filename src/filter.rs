//! Filter mappings and the `where` expressions built from them.
//!
//! A filter maps a dimension name to a value. Rendering follows the tool's
//! query syntax:
//!
//! | value          | rendered                                   |
//! |----------------|--------------------------------------------|
//! | `"Premium"`    | `{{ Dimension('store_type') }} = 'Premium'`|
//! | `["US", "EU"]` | `{{ Dimension('region') }} IN ('US', 'EU')`|
//! | `42`           | `{{ Dimension('store_id') }} = 42`         |
//!
//! Pairs are joined with ` AND ` in insertion order.
//!
//! Values are not escaped. A quote inside a value ends up in the expression
//! as-is, so filters must come from trusted callers.

use std::fmt::{self, Write as _};

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Error for filter payloads that cannot be turned into an expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("malformed filter: {0}")]
    Malformed(String),
}

/// How dimension references are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterStyle {
    /// `{{ Dimension('name') }}`, the MetricFlow template syntax.
    #[default]
    Templated,
    /// The plain dimension name.
    Bare,
}

/// Right-hand side of one filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Text(String),
    List(Vec<String>),
    Number(Number),
    Bool(bool),
}

impl FilterValue {
    fn from_json(key: &str, value: Value) -> Result<Self, FilterError> {
        match value {
            Value::String(s) => Ok(FilterValue::Text(s)),
            Value::Number(n) => Ok(FilterValue::Number(n)),
            Value::Bool(b) => Ok(FilterValue::Bool(b)),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    Value::Number(n) => Ok(n.to_string()),
                    Value::Bool(b) => Ok(b.to_string()),
                    other => Err(FilterError::Malformed(format!(
                        "list for '{}' contains {}",
                        key,
                        kind(&other)
                    ))),
                })
                .collect::<Result<_, _>>()
                .map(FilterValue::List),
            other => Err(FilterError::Malformed(format!(
                "value for '{}' is {}",
                key,
                kind(&other)
            ))),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            FilterValue::Text(s) => Value::String(s.clone()),
            FilterValue::List(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            FilterValue::Number(n) => Value::Number(n.clone()),
            FilterValue::Bool(b) => Value::Bool(*b),
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Ordered dimension → value mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filters {
    entries: Vec<(String, FilterValue)>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object. `null` yields an empty mapping.
    pub fn from_json(value: Value) -> Result<Self, FilterError> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Self::from_map(map),
            other => Err(FilterError::Malformed(format!(
                "expected an object, got {}",
                kind(&other)
            ))),
        }
    }

    /// Parse a JSON object given as text, as sent in query strings.
    pub fn parse_str(text: &str) -> Result<Self, FilterError> {
        if text.trim().is_empty() {
            return Ok(Self::new());
        }
        let value: Value = serde_json::from_str(text)
            .map_err(|e| FilterError::Malformed(format!("invalid JSON: {}", e)))?;
        Self::from_json(value)
    }

    /// Parse `dimension=value` into a text filter.
    pub fn parse_pair(pair: &str) -> Result<(String, FilterValue), FilterError> {
        match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => Ok((
                key.trim().to_string(),
                FilterValue::Text(value.trim().to_string()),
            )),
            _ => Err(FilterError::Malformed(format!(
                "expected dimension=value, got '{}'",
                pair
            ))),
        }
    }

    fn from_map(map: Map<String, Value>) -> Result<Self, FilterError> {
        let mut filters = Self::new();
        for (key, value) in map {
            let value = FilterValue::from_json(&key, value)?;
            filters.insert(key, value);
        }
        Ok(filters)
    }

    /// Add a filter, replacing an earlier value for the same dimension in place.
    pub fn insert(&mut self, dimension: impl Into<String>, value: FilterValue) {
        let dimension = dimension.into();
        match self.entries.iter_mut().find(|(key, _)| *key == dimension) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((dimension, value)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The mapping as a JSON object, for echoing back to callers.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, FilterValue)> for Filters {
    fn from_iter<I: IntoIterator<Item = (String, FilterValue)>>(iter: I) -> Self {
        let mut filters = Self::new();
        for (key, value) in iter {
            filters.insert(key, value);
        }
        filters
    }
}

impl Serialize for Filters {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, &value.to_json())?;
        }
        map.end()
    }
}

struct DimensionRef<'a> {
    name: &'a str,
    style: FilterStyle,
}

impl fmt::Display for DimensionRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.style {
            FilterStyle::Templated => write!(f, "{{{{ Dimension('{}') }}}}", self.name),
            FilterStyle::Bare => f.write_str(self.name),
        }
    }
}

/// Render filters as a conjunctive `where` expression.
///
/// Returns `None` for an empty mapping.
pub fn where_clause(filters: &Filters, style: FilterStyle) -> Option<String> {
    if filters.is_empty() {
        return None;
    }

    let mut out = String::new();
    for (i, (name, value)) in filters.iter().enumerate() {
        if i > 0 {
            out.push_str(" AND ");
        }
        let dim = DimensionRef { name, style };
        // Writing to a String cannot fail
        let _ = match value {
            FilterValue::Text(text) => write!(out, "{} = '{}'", dim, text),
            FilterValue::List(items) => write!(out, "{} IN ('{}')", dim, items.join("', '")),
            FilterValue::Number(n) => write!(out, "{} = {}", dim, n),
            FilterValue::Bool(b) => write!(out, "{} = {}", dim, if *b { "TRUE" } else { "FALSE" }),
        };
    }
    Some(out)
}
