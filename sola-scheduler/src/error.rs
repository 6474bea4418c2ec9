//! Scheduler error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Queue store failure
    #[error(transparent)]
    Store(#[from] sola_common::Error),

    /// Shard admin endpoint unreachable or unreadable
    #[error("Shard probe failed: {0}")]
    Probe(String),

    /// Worker connected with an unknown `type`
    #[error("Unknown worker type: {0}")]
    UnknownJobType(String),

    /// Job message could not be delivered to the worker connection
    #[error("Worker {0} is gone")]
    WorkerGone(uuid::Uuid),
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        SchedulerError::Store(sola_common::Error::Database(err))
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl IntoResponse for SchedulerError {
    fn into_response(self) -> Response {
        let status = match &self {
            SchedulerError::UnknownJobType(_) => StatusCode::BAD_REQUEST,
            SchedulerError::WorkerGone(_) => StatusCode::GONE,
            SchedulerError::Probe(_) => StatusCode::BAD_GATEWAY,
            SchedulerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
