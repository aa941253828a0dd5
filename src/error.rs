//! Crate-wide error categories.
//!
//! Component modules mostly define their own narrower error enums and
//! convert into [`CoreError`] at the point where the distinction between
//! categories actually matters to a caller (retry policy, user-visible
//! outcome). Glue code and binaries use `anyhow::Error` directly, the same
//! split the teacher draws between its `backup::*` error types and the
//! crate-wide `anyhow::Error` used at the API layer.

use std::path::PathBuf;

use thiserror::Error;

/// The error categories a caller of this crate needs to be able to
/// distinguish (base spec §7).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transport timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("broken pipe")]
    BrokenPipe,

    #[error("content hash mismatch for {path:?}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("not enough space to store {path:?}")]
    NotEnoughSpace { path: PathBuf },

    #[error("file index corruption: {0}")]
    IndexCorruption(String),

    #[error("change journal lost for volume {0:?}")]
    JournalLost(PathBuf),

    #[error("unsupported change journal version on volume {0:?}")]
    UnsupportedJournalVersion(PathBuf),

    #[error("permission denied: {0:?}")]
    PermissionDenied(PathBuf),

    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// Whether this error is one a caller should retry automatically
    /// (capped exponential backoff per base spec §7), as opposed to one
    /// that must be surfaced or handled specially.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout(_) | CoreError::BrokenPipe | CoreError::Io { .. }
        )
    }
}

/// Helper for turning a bare `std::io::Error` into a path-tagged
/// [`CoreError::Io`]; most call sites have a path in scope already.
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.into(),
        source,
    }
}
