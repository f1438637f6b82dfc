//! Unified error types for converge

use thiserror::Error;

/// Unified error type for all converge operations
#[derive(Error, Debug)]
pub enum ConvergeError {
    // Input errors
    #[error("Input error: {0}")]
    Input(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Backend errors
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Worth retrying: network failure, timeout, rate limit, 5xx
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// Not worth retrying: malformed request, rejected payload
    #[error("API error: {0}")]
    Api(String),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    // Ancillary errors
    #[error("Notification error: {0}")]
    Notification(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl ConvergeError {
    /// Whether another attempt at the same request could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ConvergeError::Transient(_))
    }

    /// Whether this error ends a refinement run
    pub fn is_fatal_backend(&self) -> bool {
        matches!(
            self,
            ConvergeError::Auth(_) | ConvergeError::Api(_) | ConvergeError::RetriesExhausted { .. }
        )
    }
}

/// Result type alias using ConvergeError
pub type Result<T> = std::result::Result<T, ConvergeError>;
