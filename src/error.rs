//! Error types for limiter construction and counter-store access.
use std::time::Duration;

/// Invalid limiter configuration. Fatal at construction: a limiter is never built from a
/// config that fails validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A numeric limit was below zero.
    #[error("{field} must not be negative (got {value})")]
    Negative { field: String, value: String },
    /// A rate was NaN or infinite.
    #[error("{field} must be a finite number (got {value})")]
    NotFinite { field: String, value: String },
    /// An endpoint limit key did not have the `"METHOD /path"` shape.
    #[error("invalid endpoint key {0:?}: expected \"METHOD /path\"")]
    InvalidEndpoint(String),
    /// The builder was finished without a counter store.
    #[error("a counter store is required")]
    MissingStore,
}

impl ConfigError {
    pub(crate) fn negative(field: impl Into<String>, value: impl ToString) -> Self {
        Self::Negative { field: field.into(), value: value.to_string() }
    }

    pub(crate) fn not_finite(field: impl Into<String>, value: f64) -> Self {
        Self::NotFinite { field: field.into(), value: value.to_string() }
    }
}

/// Failure talking to the counter store. Never surfaced to callers of a limiter; limiters
/// fail open on any of these.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the command.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    /// The store did not answer within the configured bound.
    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),
    /// The store answered with something the script contract does not allow.
    #[error("unexpected counter store reply: {0}")]
    Protocol(String),
}

impl StoreError {
    /// True when the error came from the call deadline rather than the store itself.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
