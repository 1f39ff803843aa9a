//! Error types for the Ratewarden engine.

use thiserror::Error;

use crate::storage::StorageError;

/// Main error type for Ratewarden operations.
///
/// Being over a limit is not an error: a blocked request is a successful
/// check whose result has `allowed == false`.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Configuration errors (missing backend parameters, unknown algorithm, unsupported scope)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid numeric rule parameters
    #[error("Validation error: {0}")]
    Validation(String),

    /// Errors raised by the storage backend, passed through unchanged
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    /// Whether this error was caused by configuration rather than at check time.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Validation(_))
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
