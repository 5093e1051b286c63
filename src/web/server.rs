//! Axum server for the headless BI API.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{ConnectMode, QuerySettings, ToolConfig};
use crate::tool::{ConnectionState, ToolClient};

use super::api;

/// Application state shared across handlers.
pub struct AppState {
    /// The one client for the semantic-layer tool.
    pub client: ToolClient,
    /// Launch configuration, used for dbt CLI fallbacks.
    pub tool: ToolConfig,
    /// Query shaping.
    pub query: QuerySettings,
}

pub type SharedState = Arc<AppState>;

/// Build the axum router with all routes.
pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/api/health", get(health))
        // Metrics
        .route("/api/metrics", get(api::list_metrics))
        .route("/api/metrics/{name}", get(api::get_metric))
        .route(
            "/api/metrics/validate-dimensions",
            post(api::validate_dimensions),
        )
        .route("/api/query", post(api::query_metrics))
        .route("/api/sql", post(api::compiled_sql))
        .route("/api/semantic-models", get(api::list_semantic_models))
        // dbt catalog
        .route("/api/models", get(api::list_models))
        .route("/api/models/{name}", get(api::get_model))
        .route("/api/sources", get(api::list_sources))
        .route("/api/lineage/{name}", get(api::get_lineage))
        .route("/api/tools", get(api::list_tools))
        // Manifest fallback
        .route("/api/parse", post(api::parse_project))
        .route("/api/manifest/metrics", get(api::manifest_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the server and run until Ctrl-C or SIGTERM, then disconnect the client.
pub async fn serve(state: SharedState, addr: SocketAddr, connect: ConnectMode) -> std::io::Result<()> {
    if connect == ConnectMode::Eager {
        // A failed eager connect is not fatal; requests retry lazily
        if let Err(e) = state.client.ensure_ready().await {
            warn!(error = %e, "initial connection to semantic-layer tool failed");
        }
    }

    let client = state.client.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(%addr, "headless BI API listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    client.disconnect().await;
    info!("server stopped");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

// ============================================================================
// Service endpoints
// ============================================================================

#[derive(Serialize)]
pub struct ServiceInfo {
    name: &'static str,
    version: &'static str,
    description: &'static str,
    endpoints: serde_json::Value,
}

/// GET / - Service description
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: "headless-bi",
        version: env!("CARGO_PKG_VERSION"),
        description: "Headless BI API powered by the dbt semantic layer",
        endpoints: serde_json::json!({
            "health": "/api/health",
            "metrics": "/api/metrics",
            "query": "/api/query",
            "sql": "/api/sql",
            "semantic_models": "/api/semantic-models",
            "models": "/api/models",
            "sources": "/api/sources",
            "lineage": "/api/lineage/{name}",
            "tools": "/api/tools",
        }),
    })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub mcp_connected: bool,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<crate::tool::protocol::Implementation>,
    pub project_dir: String,
    pub timestamp: String,
}

/// GET /api/health - Health check; never connects
pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let connection = state.client.state();
    Json(HealthResponse {
        status: "healthy",
        mcp_connected: connection == ConnectionState::Ready,
        state: connection,
        last_error: state.client.last_error().map(|e| e.to_string()),
        server: state.client.server_info(),
        project_dir: state.tool.project_dir.display().to_string(),
        timestamp: chrono::Local::now().to_rfc3339(),
    })
}
