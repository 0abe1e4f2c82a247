//! Error model for the shared primitives.

use thiserror::Error;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Kept to failures of the primitives themselves (parsing, service lookup).
/// Lease, scheduling and pipeline failures live in their own crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A service was requested from a scope that does not provide it.
    #[error("service not registered: {0}")]
    MissingService(&'static str),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
