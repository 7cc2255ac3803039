//! Error types for the wirespan binary.

use thiserror::Error;

/// Errors raised outside the capture pipeline: configuration and event
/// output.
#[derive(Error, Debug)]
pub enum Error {
    /// Settings that parse individually but do not fit together
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// An event record could not be encoded
    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
