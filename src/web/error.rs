//! Mapping from client errors to HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::filter::FilterError;
use crate::manifest::{CliError, ManifestError};
use crate::tool::{CallError, ConnectError};

/// Error returned by API handlers, rendered as `{"error": message}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Cli(#[from] CliError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Connect(_) | ApiError::Call(CallError::NotConnected) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Call(_) | ApiError::Cli(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Manifest(ManifestError::NotFound(_)) | ApiError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Manifest(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Filter(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(%status, error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
