//! Centralized error types for mboxstore.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the mboxstore library.
#[derive(Error, Debug)]
pub enum MboxError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The specified file does not exist.
    #[error("Mailbox not found: {0}")]
    FileNotFound(PathBuf),

    /// The file is neither an mbox nor an MMDF mailbox.
    #[error("File does not appear to be an mbox or MMDF mailbox: {0}")]
    InvalidMailbox(PathBuf),

    /// The on-disk structure violates the dialect. The handle is unusable.
    #[error("Mailbox '{path}' is corrupt at offset {offset}: {reason}")]
    Corrupt {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// The advisory lock is held by someone else. Retry later.
    #[error("Mailbox '{path}' is locked by another process")]
    Locked { path: PathBuf },

    /// A parse was interrupted through the cancel token.
    /// Records found before the interruption stay in the catalog.
    #[error("Parsing aborted after {parsed} message(s)")]
    Aborted { parsed: usize },

    /// Compaction failed before the live file was touched.
    #[error("Sync of '{path}' failed, mailbox left unchanged: {source}")]
    SyncFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Compaction failed while splicing. The rewritten tail was saved to `rescue`.
    #[error("Write failed on '{path}' ({source}); saved partial mailbox to {rescue}")]
    SyncUnrecoverable {
        path: PathBuf,
        rescue: PathBuf,
        source: std::io::Error,
    },

    /// Internal invariant violation. Always a bug.
    #[error("Internal inconsistency: {0}")]
    Inconsistent(String),

    /// Write operation attempted on a read-only mailbox.
    #[error("Mailbox is read-only: {0}")]
    ReadOnly(PathBuf),

    /// The handle was discarded after a fatal error.
    #[error("Mailbox handle was closed: {0}")]
    Closed(PathBuf),

    /// Operation not allowed in the mode the mailbox was opened in.
    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    /// Catalog index out of range.
    #[error("No message at index {0}")]
    NoSuchMessage(usize),
}

/// Convenience alias for `Result<T, MboxError>`.
pub type Result<T> = std::result::Result<T, MboxError>;

impl MboxError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a `Corrupt` variant.
    pub fn corrupt(path: impl Into<PathBuf>, offset: u64, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }

    /// Whether the error is transient (lock contention) rather than a failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }

    /// Whether the handle that produced this error must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Corrupt { .. }
                | Self::SyncUnrecoverable { .. }
                | Self::Inconsistent(_)
                | Self::Closed(_)
        )
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare, prefer `MboxError::io`).
impl From<std::io::Error> for MboxError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
