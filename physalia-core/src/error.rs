//! Structured error types for the Physalia workspace.

use thiserror::Error;

/// Unified error type for all Physalia operations.
#[derive(Debug, Error)]
pub enum PhysaliaError {
    /// I/O error (file not found, permission denied, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error (malformed input data)
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid input (bad arguments, out-of-range values, missing taxa)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Numerical anomaly (non-positive likelihood, non-finite derivative)
    #[error("numeric failure: {0}")]
    NumericFailure(String),

    /// Internal consistency check failed (corrupted cache, stale score)
    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    /// Memory request could not be satisfied
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the Physalia workspace.
pub type Result<T> = std::result::Result<T, PhysaliaError>;
