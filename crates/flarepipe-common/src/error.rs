//! Error types shared across the workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by the shared helpers
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidEnv {
        var: String,
        value: String,
        reason: String,
    },

    #[error("Environment variable {0} is not valid unicode")]
    NotUnicode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}
