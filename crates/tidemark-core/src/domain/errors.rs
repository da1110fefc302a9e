//! Domain error types
//!
//! Errors raised while constructing or validating domain values.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Path is not within the watched root
    #[error("Path not within watch root: {0}")]
    PathNotInRoot(String),

    /// Invalid remote ID format
    #[error("Invalid remote ID: {0}")]
    InvalidRemoteId(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// A change was built with fields that do not fit its kind
    #[error("Malformed {kind} change: {reason}")]
    MalformedChange {
        /// The kind of the offending change
        kind: String,
        /// What is wrong with it
        reason: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
