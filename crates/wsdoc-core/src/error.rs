//! Error types for wsdoc Core

use thiserror::Error;

/// Core error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to merge updates: {0}")]
    Merge(String),
}

/// Result type alias for wsdoc Core operations
pub type Result<T> = std::result::Result<T, Error>;
