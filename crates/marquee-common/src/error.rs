//! Error types shared across Marquee crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed checksum sidecar {path}: {reason}")]
    MalformedSidecar { path: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CommonError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
