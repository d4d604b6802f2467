//! Error types for voxelpipe operations

use thiserror::Error;

/// Main error type for volume and pipeline operations
#[derive(Error, Debug)]
pub enum VoxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not grid aligned: {0}")]
    Alignment(String),

    #[error("Negative index: {0}")]
    NegativeIndex(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Empty volume: no chunk stored at {0}")]
    EmptyVolume(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Storage backend error: {0}")]
    Storage(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid data type: expected {expected}, got {actual}")]
    DataTypeMismatch { expected: String, actual: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Specialized Result type for voxelpipe operations
pub type Result<T> = std::result::Result<T, VoxError>;

impl From<serde_json::Error> for VoxError {
    fn from(err: serde_json::Error) -> Self {
        VoxError::Serialization(err.to_string())
    }
}
