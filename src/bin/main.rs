//! headless-bi CLI - Query the dbt semantic layer from the command line
//!
//! Usage:
//!   headless-bi serve [--host <host>] [--port <port>] [--eager]
//!   headless-bi metrics
//!   headless-bi query --metric <name>... [--dimension <dim>...] [--filter <dim=value>...]
//!   headless-bi sql --metric <name>...
//!
//! Examples:
//!   headless-bi --project-dir ./jaffle_shop metrics
//!   headless-bi query --metric total_revenue --dimension metric_time__month --filter order__status=completed
//!   headless-bi sql --metric total_revenue --filters '{"customer__region": ["US", "EU"]}'
//!   headless-bi manifest-metrics

use clap::{Args, Parser, Subcommand, ValueEnum};
use headless_bi::config::Settings;
use headless_bi::filter::{where_clause, Filters};
use headless_bi::manifest::{DbtCli, SemanticManifest};
use headless_bi::tool::{MetricQuery, ToolClient, ToolError};
use headless_bi::{logging, ToolConfig};
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "headless-bi")]
#[command(about = "headless-bi - A headless BI API over the dbt semantic layer")]
#[command(version)]
struct Cli {
    /// Path to a settings file (defaults to HEADLESS_BI_CONFIG, ./headless-bi.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// dbt project directory (overrides settings and DBT_PROJECT_DIR)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format for results
    #[arg(short, long, global = true, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Connect to the tool before accepting requests
        #[arg(long)]
        eager: bool,
    },

    /// List available metrics
    Metrics,

    /// Show one metric
    Metric {
        /// Metric name
        name: String,
    },

    /// Query metrics
    Query(QueryArgs),

    /// Show the SQL the tool would run for a query
    Sql(QueryArgs),

    /// Check dimensions against a metric
    Validate {
        /// Metric name
        metric: String,

        /// Dimensions to check
        dimensions: Vec<String>,
    },

    /// List semantic models
    SemanticModels,

    /// List dbt models, or show one
    Models {
        /// Model name
        name: Option<String>,
    },

    /// List dbt sources
    Sources,

    /// Show the lineage of a model
    Lineage {
        /// Model name
        model: String,
    },

    /// Run `dbt parse` to regenerate the semantic manifest
    Parse,

    /// List metrics from the semantic manifest without starting the tool,
    /// running `dbt parse` first if the manifest is missing
    ManifestMetrics,

    /// List the verbs the tool advertises
    Tools,
}

#[derive(Args)]
struct QueryArgs {
    /// Metric to query (repeatable)
    #[arg(short, long = "metric", required = true)]
    metrics: Vec<String>,

    /// Dimension to group by (repeatable)
    #[arg(short, long = "dimension")]
    dimensions: Vec<String>,

    /// Filter as dimension=value (repeatable)
    #[arg(short, long = "filter")]
    filter: Vec<String>,

    /// Filters as a JSON object
    #[arg(long)]
    filters: Option<String>,

    /// Time grain for metric_time
    #[arg(long)]
    grain: Option<String>,

    /// Maximum rows to return
    #[arg(short, long)]
    limit: Option<u32>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable output
    Text,
    /// Pretty-printed JSON
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut settings = match load_settings(cli.config.as_ref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(dir) = &cli.project_dir {
        settings.tool.project_dir = Some(dir.display().to_string());
    }

    let tool = match settings.tool.resolve() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Invalid tool configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let client = ToolClient::stdio(tool.clone(), settings.client_config());
    let output = cli.output;

    match cli.command {
        Commands::Serve { host, port, eager } => {
            cmd_serve(client, tool, settings, host, port, eager).await
        }
        Commands::Metrics => {
            run(&client, output, |c| async move { Ok(Value::Array(c.list_metrics().await?)) }).await
        }
        Commands::Metric { name } => {
            run(&client, output, |c| async move { Ok(c.get_metric(&name).await?.to_json()) }).await
        }
        Commands::Query(args) => cmd_query(&client, &settings, args, output).await,
        Commands::Sql(args) => cmd_sql(&client, &settings, args).await,
        Commands::Validate { metric, dimensions } => {
            run(&client, output, |c| async move {
                Ok(c.validate_dimensions(&metric, &dimensions).await?.to_json())
            })
            .await
        }
        Commands::SemanticModels => {
            run(&client, output, |c| async move {
                Ok(Value::Array(c.list_semantic_models().await?))
            })
            .await
        }
        Commands::Models { name } => {
            run(&client, output, |c| async move {
                match name {
                    Some(name) => Ok(c.get_model(&name).await?.to_json()),
                    None => Ok(Value::Array(c.list_models().await?)),
                }
            })
            .await
        }
        Commands::Sources => {
            run(&client, output, |c| async move { Ok(Value::Array(c.list_sources().await?)) }).await
        }
        Commands::Lineage { model } => {
            run(&client, output, |c| async move { Ok(c.get_lineage(&model).await?.to_json()) }).await
        }
        Commands::Parse => cmd_parse(&tool).await,
        Commands::ManifestMetrics => cmd_manifest_metrics(&tool, output).await,
        Commands::Tools => {
            run(&client, output, |c| async move {
                let tools = c.list_tools().await?;
                Ok(serde_json::json!(tools))
            })
            .await
        }
    }
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings, headless_bi::config::SettingsError> {
    match path {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    }
}

/// Connect, run one operation, print its result, disconnect.
async fn run<F, Fut>(client: &ToolClient, output: OutputFormat, op: F) -> ExitCode
where
    F: FnOnce(ToolClient) -> Fut,
    Fut: Future<Output = Result<Value, ToolError>>,
{
    let result = match client.ensure_ready().await {
        Ok(()) => op(client.clone()).await,
        Err(e) => Err(e.into()),
    };
    client.disconnect().await;

    match result {
        Ok(value) => {
            print_value(&value, output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_value(value: &Value, output: OutputFormat) {
    match output {
        OutputFormat::Json => match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{}", text),
            Err(_) => println!("{}", value),
        },
        OutputFormat::Text => match value {
            Value::Array(items) => {
                for item in items {
                    println!("{}", describe(item));
                }
            }
            Value::String(s) => println!("{}", s),
            other => println!("{}", serde_json::to_string_pretty(other).unwrap_or_default()),
        },
    }
}

/// One line per record: the name, plus label or description when present.
fn describe(item: &Value) -> String {
    let name = item.get("name").and_then(Value::as_str);
    let detail = item
        .get("label")
        .or_else(|| item.get("description"))
        .and_then(Value::as_str)
        .filter(|d| !d.is_empty() && Some(*d) != name);

    match (name, detail) {
        (Some(name), Some(detail)) => format!("  - {} ({})", name, detail),
        (Some(name), None) => format!("  - {}", name),
        _ => item.to_string(),
    }
}

fn build_query(settings: &Settings, args: QueryArgs) -> Result<MetricQuery, String> {
    let mut filters = match &args.filters {
        Some(json) => Filters::parse_str(json).map_err(|e| e.to_string())?,
        None => Filters::new(),
    };
    for pair in &args.filter {
        let (key, value) = Filters::parse_pair(pair).map_err(|e| e.to_string())?;
        filters.insert(key, value);
    }

    Ok(MetricQuery::new(args.metrics)
        .dimensions(args.dimensions)
        .filter(where_clause(&filters, settings.query.filter_style))
        .time_grain(args.grain)
        .limit(args.limit))
}

async fn cmd_query(
    client: &ToolClient,
    settings: &Settings,
    args: QueryArgs,
    output: OutputFormat,
) -> ExitCode {
    let query = match build_query(settings, args) {
        Ok(q) => q,
        Err(e) => {
            eprintln!("Invalid query: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(filter) = &query.where_clause {
        tracing::debug!(%filter, "query filter");
    }
    run(client, output, |c| async move {
        Ok(c.query_metrics(&query).await?.to_json())
    })
    .await
}

async fn cmd_sql(client: &ToolClient, settings: &Settings, args: QueryArgs) -> ExitCode {
    let query = match build_query(settings, args) {
        Ok(q) => q,
        Err(e) => {
            eprintln!("Invalid query: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // SQL is printed as-is regardless of the output format
    run(client, OutputFormat::Text, |c| async move {
        Ok(Value::String(c.compiled_sql(&query).await?))
    })
    .await
}

async fn cmd_parse(tool: &ToolConfig) -> ExitCode {
    let cli = DbtCli::from_config(tool);
    println!("Running dbt parse in {}...", tool.project_dir.display());

    match cli.parse().await {
        Ok(_) => {
            println!("OK: semantic manifest at {}", cli.manifest_path().display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_manifest_metrics(tool: &ToolConfig, output: OutputFormat) -> ExitCode {
    let manifest = match SemanticManifest::load_or_parse(&DbtCli::from_config(tool)).await {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let metrics = manifest.metrics();
    match output {
        OutputFormat::Json => match serde_json::to_string_pretty(&metrics) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        OutputFormat::Text => {
            println!("Metrics ({}):", metrics.len());
            for metric in &metrics {
                println!("  - {} [{}] {}", metric.name, metric.kind, metric.label);
            }
        }
    }
    ExitCode::SUCCESS
}

#[cfg(feature = "server")]
async fn cmd_serve(
    client: ToolClient,
    tool: ToolConfig,
    settings: Settings,
    host: Option<String>,
    port: Option<u16>,
    eager: bool,
) -> ExitCode {
    use headless_bi::config::ConnectMode;
    use headless_bi::web::{serve, AppState};
    use std::net::SocketAddr;
    use std::sync::Arc;

    let host = host.unwrap_or_else(|| settings.server.host.clone());
    let port = port.unwrap_or(settings.server.port);
    let addr: SocketAddr = match format!("{}:{}", host, port).parse() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Invalid address '{}:{}': {}", host, port, e);
            return ExitCode::FAILURE;
        }
    };
    let connect = if eager {
        ConnectMode::Eager
    } else {
        settings.server.connect
    };

    println!("headless-bi API");
    println!("   URL: http://{}", addr);
    println!("   Project: {}", tool.project_dir.display());
    println!();
    println!("   Press Ctrl+C to stop");

    let state = Arc::new(AppState {
        client,
        tool,
        query: settings.query,
    });

    match serve(state, addr, connect).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(feature = "server"))]
async fn cmd_serve(
    _client: ToolClient,
    _tool: ToolConfig,
    _settings: Settings,
    _host: Option<String>,
    _port: Option<u16>,
    _eager: bool,
) -> ExitCode {
    eprintln!("This build has no HTTP server; rebuild with --features server");
    ExitCode::FAILURE
}
