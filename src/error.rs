//! Error types for the Souq guard.

use thiserror::Error;

/// Main error type for guard operations.
///
/// Rate limit rejections are not errors; they are ordinary results. This type
/// covers configuration problems and the durable stores behind the lockout
/// policy and the security log.
#[derive(Error, Debug)]
pub enum GuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed-login state could not be read or written
    #[error("Login state store error: {0}")]
    Store(String),

    /// Security log write failed
    #[error("Security log error: {0}")]
    SecurityLog(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for guard operations.
pub type Result<T> = std::result::Result<T, GuardError>;
