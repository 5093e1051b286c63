//! HTTP API for headless BI.
//!
//! Every route is a thin adapter: parse input, make sure the tool is
//! connected, forward one verb, shape the JSON.

#[cfg(feature = "server")]
mod api;
#[cfg(feature = "server")]
mod error;
#[cfg(feature = "server")]
mod server;

#[cfg(feature = "server")]
pub use api::*;
#[cfg(feature = "server")]
pub use error::ApiError;
#[cfg(feature = "server")]
pub use server::*;
