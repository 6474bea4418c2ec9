//! Common error types for Sola

use thiserror::Error;

/// Common result type for Sola operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the shared stores and configuration layer
#[derive(Error, Debug)]
pub enum Error {
    /// Relational store error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Counter cache failure (connection refused, bad reply, ...)
    #[error("Cache error: {0}")]
    Cache(String),

    /// An external call did not complete within its deadline
    #[error("Timed out after {millis} ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid identifier or parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            millis: duration.as_millis() as u64,
        }
    }
}
