//! Error types for kbforge.
//!
//! Library crates use [`KbError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all kbforge operations.
#[derive(Debug, thiserror::Error)]
pub enum KbError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP failure that is worth retrying on the next cycle.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The batch service answered but refused the request (non-zero `code`).
    #[error("remote rejected request: {0}")]
    RemoteRejected(String),

    /// The batch service reported a terminal failure for a job.
    #[error("remote job failed: {0}")]
    RemoteJobFailed(String),

    /// A result download did not complete; nothing was promoted to the final path.
    #[error("incomplete download of {url}: {reason}")]
    IncompleteDownload { url: String, reason: String },

    /// The extraction collaborator failed for one unit.
    #[error("extraction error: {0}")]
    Extraction(String),

    /// A graph store batch write failed.
    #[error("graph batch write failed: {0}")]
    WriteBatch(String),

    /// A task state change that the state machine does not allow.
    #[error("invalid transition for task {task_id}: {from} -> {event}")]
    InvalidTransition {
        task_id: String,
        from: String,
        event: String,
    },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// JSON or response parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, KbError>;

impl KbError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an incomplete-download error.
    pub fn incomplete_download(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::IncompleteDownload {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_) | Self::IncompleteDownload { .. } | Self::Parse { .. }
        )
    }
}
