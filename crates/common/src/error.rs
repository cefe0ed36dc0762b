//! Error types for TraceTriage

use thiserror::Error;

/// Result type alias using the TraceTriage Error
pub type Result<T> = std::result::Result<T, Error>;

/// TraceTriage error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse test report JSON: {0}")]
    ReportParse(String),

    #[error("Trace error: {0}")]
    Trace(#[from] crate::trace::TraceError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Missing artifact: {0}")]
    MissingArtifact(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Analysis timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}
