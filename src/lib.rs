//! # headless-bi
//!
//! A headless BI gateway in front of the dbt semantic layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │           HTTP API (web) / CLI (bin/main.rs)            │
//! └─────────────────────────────────────────────────────────┘
//!              │ filters                │ verbs
//!              ▼                        ▼
//! ┌──────────────────────┐  ┌───────────────────────────────┐
//! │  filter              │  │  tool::ToolClient             │
//! │  mapping → where     │  │  connect / call / disconnect  │
//! └──────────────────────┘  └───────────────────────────────┘
//!                                       │ JSON-RPC over stdio
//!                                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        dbt MCP server (MetricFlow, dbt catalog)         │
//! └─────────────────────────────────────────────────────────┘
//!                                       │ dbt parse
//!                                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │  manifest: target/semantic_manifest.json (fallback)     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Metric computation and SQL generation belong to the tool; this crate
//! forwards requests and reshapes the answers.

pub mod config;
pub mod filter;
pub mod logging;
pub mod manifest;
pub mod tool;

#[cfg(feature = "server")]
pub mod web;

pub use config::{Settings, ToolConfig};
pub use filter::{where_clause, FilterError, FilterStyle, FilterValue, Filters};
pub use tool::{CallError, ConnectError, ConnectionState, MetricQuery, ToolClient};
