//! dbt project artifacts used when the tool server is not needed.
//!
//! The semantic manifest (`target/semantic_manifest.json`) is produced by
//! `dbt parse`. Reading it directly gives a metric list without a running
//! server.

mod cli;

pub use cli::{CliError, CommandOutput, DbtCli};

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Errors from loading the semantic manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("semantic manifest not found at {0}; run `dbt parse` first")]
    NotFound(PathBuf),

    #[error("failed to read semantic manifest: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse semantic manifest: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The parts of the semantic manifest this crate reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SemanticManifest {
    #[serde(default)]
    metrics: Vec<RawMetric>,
    #[serde(default)]
    semantic_models: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawMetric {
    name: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

/// Flat description of one metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub name: String,
    pub label: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SemanticManifest {
    /// Load the manifest from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ManifestError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Load the project's manifest, running `dbt parse` first when it is
    /// missing. A failed parse is logged; the load then reports what is on disk.
    pub async fn load_or_parse(cli: &DbtCli) -> Result<Self, ManifestError> {
        if let Err(e) = cli.ensure_manifest().await {
            warn!(error = %e, "dbt parse failed while generating the semantic manifest");
        }
        Self::load(cli.manifest_path())
    }

    /// Parse manifest JSON.
    pub fn from_json(content: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Metrics with display defaults filled in.
    pub fn metrics(&self) -> Vec<MetricSummary> {
        self.metrics
            .iter()
            .map(|m| MetricSummary {
                name: m.name.clone(),
                label: m
                    .label
                    .clone()
                    .filter(|l| !l.is_empty())
                    .unwrap_or_else(|| m.name.clone()),
                description: m.description.clone().unwrap_or_default(),
                kind: m.kind.clone().unwrap_or_else(|| "unknown".to_string()),
            })
            .collect()
    }

    /// Number of semantic models declared.
    pub fn semantic_model_count(&self) -> usize {
        self.semantic_models.len()
    }
}
