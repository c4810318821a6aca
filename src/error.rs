//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// The admission decisions themselves never fail; errors only surface while
/// constructing the primitives or loading configuration and traces.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A constructor argument is outside its valid range
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A replay trace is malformed
    #[error("Invalid trace: {0}")]
    InvalidTrace(String),

    /// No async runtime is available to host a background task
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
