//! Closed error *kinds* for the write-path core (spec §7).
//!
//! Library collaborators (`wal`) keep their own `thiserror` enums; this one
//! lives at the orchestration layer so call sites that care about the kind
//! (option validation, `no_slowdown` handling, background-error escalation)
//! can match on it instead of string-sniffing an `anyhow::Error`.

use thiserror::Error;

/// Error kinds returned by the write coordinator and its collaborators.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Option combination rejected before the writer ever joins the queue.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// `merge` without a merge operator, or a disallowed mode combination.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// A null or unparsable batch.
    #[error("corruption: {0}")]
    Corruption(String),
    /// Write stall under `no_slowdown`, or a background stop during shutdown.
    #[error("incomplete: {0}")]
    Incomplete(String),
    /// WAL append, fsync, or directory sync failed.
    #[error("I/O error: {0}")]
    IoError(String),
    /// Propagated from background state (e.g. compaction backpressure).
    #[error("busy: {0}")]
    Busy(String),
    /// The engine is shutting down and rejects new writes.
    #[error("shutdown in progress")]
    ShutdownInProgress,
    /// Terminal: an unrecoverable I/O error has fenced the engine. No further
    /// writes succeed.
    #[error("I/O fenced; engine no longer accepts writes")]
    IoFenced,
}

impl EngineError {
    /// `true` for kinds the spec says should *not* be escalated to a
    /// background error even when `paranoid_checks` is on.
    pub fn is_transient_for_paranoid_checks(&self) -> bool {
        matches!(self, EngineError::Busy(_) | EngineError::Incomplete(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::IoError(e.to_string())
    }
}

impl From<wal::WalError> for EngineError {
    fn from(e: wal::WalError) -> Self {
        EngineError::IoError(e.to_string())
    }
}

/// Convenience alias used throughout the write path.
pub type EngineResult<T> = Result<T, EngineError>;
