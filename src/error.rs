//! Error types for emissary

use thiserror::Error;
use uuid::Uuid;

use crate::models::RunErrorKind;

/// Main error type for emissary
#[derive(Debug, Error)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A referenced row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Registration/reference validation failures
    #[error("Validation error: {0}")]
    Validation(String),

    /// LLM provider errors
    #[error("Provider error: {0}")]
    Provider(String),

    /// A run reached a terminal failure state. This is what waiters see;
    /// raw provider/tool errors never escape through this variant.
    #[error("Run {run_id} failed ({kind}): {message}")]
    Run {
        run_id: Uuid,
        session_id: Uuid,
        kind: RunErrorKind,
        message: String,
    },

    /// Waiting on a run exceeded the caller's deadline
    #[error("Timed out waiting for run {0}")]
    WaitTimeout(Uuid),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQL errors
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Reqwest HTTP client errors
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for emissary operations
pub type Result<T> = std::result::Result<T, Error>;
