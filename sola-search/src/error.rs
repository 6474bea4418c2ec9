//! Search request error taxonomy
//!
//! Every variant maps to exactly one HTTP status. The release routine writes
//! the same status to the search log, except for failed image downloads,
//! which answer with the image host's status but are logged as 400.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Reasons a search request is rejected or fails
#[derive(Debug, Error)]
pub enum SearchError {
    /// API key not found (403)
    #[error("Invalid API key")]
    InvalidKey,

    /// Monthly successful searches reached the account quota (402)
    #[error("Search quota depleted")]
    QuotaExceeded,

    /// Too many in-flight searches for this account (402)
    #[error("Concurrency limit exceeded")]
    ConcurrencyExceeded,

    /// Global priority backlog reached the queue cap (503)
    #[error("Error: Search queue is full")]
    QueueFull,

    /// Malformed URL, unfetchable or unreadable image (400)
    #[error("{0}")]
    BadInput(String),

    /// Image host answered with an error status (host's status, logged as 400)
    #[error("{message}")]
    ImageFetchFailed { status: u16, message: String },

    /// Neither an uploaded image nor an image URL (405)
    #[error("Method Not Allowed")]
    MethodNotAllowed,

    /// Frame extraction or border cropping failed (400)
    #[error("{0}")]
    ImageProcessingFailed(String),

    /// A shard answered 504 (504)
    #[error("Database is overloaded")]
    UpstreamOverloaded,

    /// A shard answered another 5xx or could not be reached (shard's status)
    #[error("Database is offline")]
    UpstreamDown { status: u16 },

    /// A shard answered with an embedded error (500)
    #[error("{0}")]
    UpstreamLogicError(String),

    /// Counter cache or relational store failure (500)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SearchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SearchError::InvalidKey => StatusCode::FORBIDDEN,
            SearchError::QuotaExceeded | SearchError::ConcurrencyExceeded => {
                StatusCode::PAYMENT_REQUIRED
            }
            SearchError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            SearchError::BadInput(_) | SearchError::ImageProcessingFailed(_) => {
                StatusCode::BAD_REQUEST
            }
            SearchError::ImageFetchFailed { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            SearchError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            SearchError::UpstreamOverloaded => StatusCode::GATEWAY_TIMEOUT,
            SearchError::UpstreamDown { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
            }
            SearchError::UpstreamLogicError(_) | SearchError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Status recorded in the search log for this failure
    pub fn log_status(&self) -> u16 {
        match self {
            SearchError::ImageFetchFailed { .. } => 400,
            other => other.status_code().as_u16(),
        }
    }
}

impl From<sola_common::Error> for SearchError {
    fn from(err: sola_common::Error) -> Self {
        SearchError::Internal(err.to_string())
    }
}

impl IntoResponse for SearchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "frameCount": 0,
            "error": self.to_string(),
            "result": [],
        }));
        (status, body).into_response()
    }
}
