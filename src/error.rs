//! Error types for the binding engine.

use thiserror::Error;

/// Main error type for bind operations.
#[derive(Debug, Error)]
pub enum BindError {
    /// The bind target is neither a document nor a collection identity.
    #[error("Invalid bind source: {0:?}")]
    InvalidSource(String),

    /// The snapshot source reported a transport failure before the binding
    /// settled. Failures after settle are left to the source's own retry
    /// policy and never surface here.
    #[error("Snapshot source failed before settle: {0}")]
    SourceFailure(String),

    /// The binding was released before its first snapshot settled.
    #[error("Binding was released before it settled")]
    Unbound,
}

/// Result type for bind operations.
pub type Result<T> = std::result::Result<T, BindError>;
