//! Error types for the Quotagate service.

use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for Quotagate operations.
#[derive(Error, Debug)]
pub enum QuotagateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors surfaced outside the request path
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for QuotagateError {
    fn from(err: config::ConfigError) -> Self {
        QuotagateError::Config(err.to_string())
    }
}

/// Result type alias for Quotagate operations.
pub type Result<T> = std::result::Result<T, QuotagateError>;
