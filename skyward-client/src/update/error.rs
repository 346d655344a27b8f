//! Error types for the update client.

use std::path::PathBuf;
use thiserror::Error;

use skyward_engine::EngineError;

use super::status::FailureReason;

/// Errors raised by the Download Engine.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Transient transport failure. Retried inside the engine.
    #[error("Network error: {0}")]
    Network(String),

    /// Retries exhausted on transient failures.
    #[error("Download failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// The server answered with a status that retrying will not fix.
    #[error("Server returned HTTP {status}")]
    Http { status: u16 },

    /// The server announced or delivered a size other than the expected one.
    #[error("Size mismatch: expected {expected} bytes, server reported {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Local write failure (disk full, permissions). Never retried.
    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("A download to {0} is already running")]
    AlreadyRunning(PathBuf),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DownloadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::Network(_))
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        DownloadError::Network(e.to_string())
    }
}

/// Errors raised by the Persistence Store and the resume journal.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt state in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors surfaced by the orchestrator.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to parse manifest: {0}")]
    Parse(String),

    #[error("Integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Disk error: {0}")]
    Disk(String),

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Platform apply failed with code {code}")]
    PlatformApply { code: i32 },

    #[error("Device rebooted into the previous build")]
    RolledBack,

    #[error("Battery too low to proceed")]
    PowerGateDenied,

    #[error("Another update session is active")]
    Busy,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Update cancelled")]
    Cancelled,

    #[error("Update engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Orchestrator is not running")]
    Shutdown,
}

impl UpdateError {
    /// Reason code reported with a `Failed` status.
    pub fn reason(&self) -> FailureReason {
        match self {
            UpdateError::Network(_) => FailureReason::Network,
            UpdateError::Parse(_) => FailureReason::Parse,
            UpdateError::IntegrityMismatch { .. } => FailureReason::IntegrityMismatch,
            UpdateError::Disk(_) | UpdateError::Store(_) => FailureReason::Disk,
            UpdateError::SizeMismatch { .. } => FailureReason::SizeMismatch,
            UpdateError::PlatformApply { code } => FailureReason::PlatformApply { code: *code },
            UpdateError::RolledBack => FailureReason::RolledBack,
            UpdateError::Cancelled => FailureReason::Cancelled,
            UpdateError::Engine(_) => FailureReason::Engine,
            UpdateError::PowerGateDenied
            | UpdateError::Busy
            | UpdateError::InvalidState(_)
            | UpdateError::Shutdown => FailureReason::Internal,
        }
    }
}

impl From<DownloadError> for UpdateError {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::Network(msg) => UpdateError::Network(msg),
            e @ DownloadError::RetriesExhausted { .. } => UpdateError::Network(e.to_string()),
            e @ DownloadError::Http { .. } => UpdateError::Network(e.to_string()),
            DownloadError::SizeMismatch { expected, actual } => {
                UpdateError::SizeMismatch { expected, actual }
            }
            DownloadError::Disk(e) => UpdateError::Disk(e.to_string()),
            e @ DownloadError::AlreadyRunning(_) => UpdateError::InvalidState(e.to_string()),
            DownloadError::Internal(msg) => UpdateError::InvalidState(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_failure_has_a_reason() {
        let err: UpdateError = DownloadError::Disk(std::io::Error::new(
            std::io::ErrorKind::Other,
            "No space left on device",
        ))
        .into();
        assert_eq!(err.reason(), FailureReason::Disk);

        let err: UpdateError = DownloadError::RetriesExhausted {
            attempts: 4,
            last: "connection reset".into(),
        }
        .into();
        assert_eq!(err.reason(), FailureReason::Network);

        assert_eq!(
            UpdateError::PlatformApply { code: 10 }.reason(),
            FailureReason::PlatformApply { code: 10 }
        );
        assert_eq!(UpdateError::RolledBack.reason(), FailureReason::RolledBack);
    }

    #[test]
    fn test_only_network_errors_retry() {
        assert!(DownloadError::Network("reset".into()).is_retryable());
        assert!(!DownloadError::Http { status: 404 }.is_retryable());
        assert!(!DownloadError::SizeMismatch {
            expected: 1,
            actual: 2
        }
        .is_retryable());
    }
}
