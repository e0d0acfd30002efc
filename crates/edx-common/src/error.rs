//! Error types for EDX

use thiserror::Error;

/// Result type alias for EDX operations
pub type Result<T> = std::result::Result<T, EdxError>;

/// Main error type for shared EDX utilities
#[derive(Error, Debug)]
pub enum EdxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid region code: {0}")]
    InvalidRegion(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
