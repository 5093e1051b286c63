//! Client for the external semantic-layer tool.
//!
//! The tool (dbt + MetricFlow behind an MCP server) runs as a child process
//! and owns all metric definitions and SQL generation. This module manages
//! the connection to it and forwards verbs.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 headless-bi (Rust + Tokio)                      │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                   ToolClient (Async)                      │  │
//! │  │  - Disconnected → Connecting → Ready state slot           │  │
//! │  │  - Concurrent connects join one attempt                   │  │
//! │  │  - Calls serialised, NotConnected unless Ready            │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │ Connector / Session              │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │        StdioConnector → McpSession → RpcTransport         │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │              stdin (JSON-RPC) │ stdout (JSON-RPC)               │
//! └───────────────────────────────┼─────────────────────────────────┘
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          dbt MCP server (long-running child process)            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use headless_bi::config::ToolConfig;
//! use headless_bi::tool::{ClientConfig, MetricQuery, ToolClient};
//!
//! let client = ToolClient::stdio(ToolConfig::dbt_mcp("./jaffle_shop"), ClientConfig::default());
//! client.ensure_ready().await?;
//!
//! let query = MetricQuery::new(["total_revenue"]).dimensions(["metric_time__month"]);
//! let rows = client.query_metrics(&query).await?.records();
//!
//! client.disconnect().await;
//! ```

mod client;
mod error;
pub mod protocol;
mod session;
mod stdio;
mod transport;
mod verbs;

pub use client::{ClientConfig, ConnectionState, ToolClient, DEFAULT_HANDSHAKE_TIMEOUT};
pub use error::{CallError, CallResult, ConnectError, ToolError, TransportError, TransportResult};
pub use session::{Connector, McpSession, Response, Session};
pub use stdio::StdioConnector;
pub use transport::RpcTransport;
pub use verbs::{MetricQuery, Verb, VerbGroup, VerbNames};
