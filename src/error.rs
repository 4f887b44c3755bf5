// src/error.rs

//! Unified error handling for the sync subsystem.

use std::fmt;

use thiserror::Error;

/// Result type alias for bmsync operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed hash, image or request shape. Never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Backing store unavailable. The caller retries with backoff.
    #[error("Store unavailable: {0}")]
    TransientStore(String),

    /// A concurrent writer won the compare-and-swap race.
    #[error("Conflict on {key}: {message}")]
    ConflictLost { key: String, message: String },

    /// Incremental pull issued without a `since` watermark
    #[error("Incremental pull on '{collection}' requires a since watermark")]
    SyncWatermarkMissing { collection: String },

    /// A push cycle for the collection is already running
    #[error("Sync already in progress for '{collection}'")]
    SyncInProgress { collection: String },

    /// Operation cancelled by its token
    #[error("Operation cancelled")]
    Cancelled,

    /// No extraction attempt produced a usable result
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// HTTP request failed
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a transient store error.
    pub fn transient(message: impl fmt::Display) -> Self {
        Self::TransientStore(message.to_string())
    }

    /// Create a lost-race conflict for the given key.
    pub fn conflict(key: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::ConflictLost {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Create a missing-watermark error.
    pub fn watermark_missing(collection: impl fmt::Display) -> Self {
        Self::SyncWatermarkMissing {
            collection: collection.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }

    /// Whether this is a lost compare-and-swap race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConflictLost { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_errors_are_retryable() {
        assert!(AppError::transient("connection refused").is_retryable());
        assert!(!AppError::invalid_input("bad hash").is_retryable());
        assert!(!AppError::conflict("abc", "revision moved").is_retryable());
    }

    #[test]
    fn test_conflict_message_names_key() {
        let err = AppError::conflict("deadbeef", "revision 2 != 3");
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), "Conflict on deadbeef: revision 2 != 3");
    }
}
