//! Error types for the inferflow service.

use std::time::Duration;
use thiserror::Error;

/// A specialized Result type for inferflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for inferflow operations.
///
/// Public operations on the metadata store, artifact registry, and job
/// pipeline never leak lower-level errors; everything a caller can observe
/// is one of these variants.
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────
    // Catalog errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate artifact: {0}")]
    DuplicateArtifact(String),

    #[error("model {model}:{version} does not support task '{task}'")]
    UnsupportedTask {
        model: String,
        version: String,
        task: String,
    },

    #[error("metadata store failure: {0}")]
    StoreFailure(String),

    // ─────────────────────────────────────────────────────────────────────
    // Inference errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("artifact load failed: {0}")]
    LoadFailure(String),

    #[error("inference failed: {0}")]
    InferenceFailure(String),

    #[error("job exceeded hard time limit of {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("job queue unavailable: {0}")]
    QueueUnavailable(String),

    // ─────────────────────────────────────────────────────────────────────
    // Ambient errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error is the normal "no such row / expired" outcome
    /// rather than a genuine failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<duckdb::Error> for Error {
    fn from(err: duckdb::Error) -> Self {
        Error::StoreFailure(err.to_string())
    }
}
