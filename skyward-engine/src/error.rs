//! Error types for the update engine adapters.

use thiserror::Error;

/// Errors that can occur while driving the platform apply mechanism.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The platform mechanism could not be reached or refused the request.
    #[error("Platform mechanism unavailable: {0}")]
    Unavailable(String),

    /// A precondition for the requested operation does not hold
    /// (e.g. A-only apply outside of the apply mode).
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// An apply is already running on this engine.
    #[error("An apply operation is already in progress")]
    AlreadyApplying,

    /// The operation is not supported by this engine variant.
    #[error("Operation not supported by {engine} engine: {operation}")]
    Unsupported {
        engine: &'static str,
        operation: &'static str,
    },

    /// The platform reported something we could not interpret.
    #[error("Unexpected platform response: {0}")]
    Protocol(String),

    /// Local I/O failure (marker files, command spawning).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
