//! Domain error model.

use thiserror::Error;

/// Result type used by identifiers.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Storage, concurrency and delivery failures have their own error types in
/// the infra and events crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was invalid (e.g. empty key).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
