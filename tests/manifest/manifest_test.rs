//! Reading the semantic manifest from a project directory.

use std::fs;
use std::path::Path;
use std::time::Duration;

use headless_bi::config::{manifest_path_in, ToolConfig};
use headless_bi::manifest::{DbtCli, ManifestError, MetricSummary, SemanticManifest};

const MANIFEST: &str = r#"{
  "semantic_models": [{"name": "orders"}],
  "metrics": [
    {
      "name": "total_revenue",
      "label": "Total Revenue",
      "description": "Sum of order amounts",
      "type": "simple",
      "type_params": {"measure": {"name": "order_total"}}
    },
    {"name": "order_count", "label": "", "type": "simple"},
    {"name": "average_order_value", "description": null}
  ],
  "project_configuration": {}
}"#;

fn write_manifest(project: &Path) {
    let target = project.join("target");
    fs::create_dir_all(&target).unwrap();
    fs::write(target.join("semantic_manifest.json"), MANIFEST).unwrap();
}

#[test]
fn test_metrics_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path());

    let manifest = SemanticManifest::load(manifest_path_in(dir.path())).unwrap();
    let metrics = manifest.metrics();

    assert_eq!(metrics.len(), 3);
    assert_eq!(
        metrics[0],
        MetricSummary {
            name: "total_revenue".to_string(),
            label: "Total Revenue".to_string(),
            description: "Sum of order amounts".to_string(),
            kind: "simple".to_string(),
        }
    );
    assert_eq!(metrics[1].label, "order_count");
    assert_eq!(metrics[2].description, "");
    assert_eq!(metrics[2].kind, "unknown");
    assert_eq!(manifest.semantic_model_count(), 1);
}

#[test]
fn test_summary_serializes_type_field() {
    let summary = MetricSummary {
        name: "m".to_string(),
        label: "M".to_string(),
        description: String::new(),
        kind: "ratio".to_string(),
    };
    let value = serde_json::to_value(&summary).unwrap();
    assert_eq!(value["type"], "ratio");
}

#[test]
fn test_missing_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let err = SemanticManifest::load(manifest_path_in(dir.path())).unwrap_err();
    assert!(matches!(err, ManifestError::NotFound(_)));
    assert!(err.to_string().contains("dbt parse"));
}

#[test]
fn test_corrupt_manifest() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("target")).unwrap();
    fs::write(dir.path().join("target/semantic_manifest.json"), "{\"metrics\": [").unwrap();

    let err = SemanticManifest::load(manifest_path_in(dir.path())).unwrap_err();
    assert!(matches!(err, ManifestError::Parse(_)));
}

#[tokio::test]
async fn test_ensure_manifest_skips_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path());

    let mut config = ToolConfig::dbt_mcp(dir.path());
    config.dbt_path = "/no/such/dbt".into();
    let cli = DbtCli::from_config(&config);

    assert!(!cli.ensure_manifest().await.unwrap());
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_command_reports_output() {
    let dir = tempfile::tempdir().unwrap();
    // `false` ignores its arguments and exits 1
    let cli = DbtCli::new("false", dir.path(), dir.path(), Duration::from_secs(5));

    let output = cli.run(&["parse", "--quiet"]).await.unwrap();
    assert!(!output.success);
    assert_eq!(output.code, Some(1));
    assert!(cli.parse().await.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_ensure_manifest_parses_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    // `true` stands in for a dbt that succeeds without writing anything
    let cli = DbtCli::new("true", dir.path(), dir.path(), Duration::from_secs(5));

    assert!(cli.ensure_manifest().await.unwrap());
}

#[cfg(unix)]
#[tokio::test]
async fn test_load_or_parse_generates_missing_manifest() {
    let dir = tempfile::tempdir().unwrap();
    // `sh parse --quiet` runs this script in the project directory
    fs::write(
        dir.path().join("parse"),
        "mkdir -p target\necho '{\"metrics\": [{\"name\": \"order_count\", \"type\": \"simple\"}]}' > target/semantic_manifest.json\n",
    )
    .unwrap();
    let cli = DbtCli::new("sh", dir.path(), dir.path(), Duration::from_secs(5));

    let manifest = SemanticManifest::load_or_parse(&cli).await.unwrap();
    let metrics = manifest.metrics();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].name, "order_count");
    assert_eq!(metrics[0].kind, "simple");
}

#[tokio::test]
async fn test_load_or_parse_reports_missing_manifest_when_parse_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cli = DbtCli::new("/no/such/dbt", dir.path(), dir.path(), Duration::from_secs(5));

    let err = SemanticManifest::load_or_parse(&cli).await.unwrap_err();
    assert!(matches!(err, ManifestError::NotFound(_)));
}

#[tokio::test]
async fn test_load_or_parse_reads_existing_manifest_without_parsing() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path());
    let cli = DbtCli::new("/no/such/dbt", dir.path(), dir.path(), Duration::from_secs(5));

    let manifest = SemanticManifest::load_or_parse(&cli).await.unwrap();
    assert_eq!(manifest.metrics().len(), 3);
}
