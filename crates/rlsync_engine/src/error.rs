//! Error types for the sync engine.

use rlsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Errors are `Clone` because a single failure is often reported to several
/// delegates (a fetch failure reaches both the versioning wrapper and the
/// caller's delegate).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server rejected our credentials (401/403).
    #[error("authentication invalid (HTTP {0})")]
    AuthenticationInvalid(u16),

    /// The server answered with an unexpected status.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The collection changed underneath a conditional request (412).
    #[error("collection modified concurrently")]
    ConcurrentModification,

    /// The server returned an offset although only one batch was allowed.
    #[error("server returned more than one batch but multiple batches are disallowed")]
    MultipleBatchesDisallowed,

    /// A record exceeds the server's per-record payload limit.
    #[error("record {guid} is too large: {size} bytes (limit {limit})")]
    RecordTooLarge {
        /// Record guid.
        guid: String,
        /// Serialized size.
        size: u64,
        /// Server limit.
        limit: u64,
    },

    /// The server refused one record of an upload.
    #[error("server rejected record {guid}: {reason}")]
    RecordRejected {
        /// Record guid.
        guid: String,
        /// Reason given by the server.
        reason: String,
    },

    /// Invalid session state transition.
    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidSessionTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// An operation was attempted on a session that is not active.
    #[error("session is not active (state {0})")]
    InactiveSession(String),

    /// The guid to local-version map lost or gained entries during an upload.
    #[error("version map invariant violated: {0}")]
    VersionMapInvariant(String),

    /// A record read for versioned upload carried no local version.
    #[error("record {0} has no local version")]
    UnversionedRecord(String),

    /// The repository was configured inconsistently.
    #[error("illegal configuration: {0}")]
    IllegalConfiguration(String),

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A pipeline stage finished with failures.
    #[error("stage {stage} failed with {failures} failure(s)")]
    StageFailed {
        /// Stage name.
        stage: String,
        /// Number of failed items.
        failures: usize,
    },

    /// Local storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A worker queue could not be started or has shut down.
    #[error("executor error: {0}")]
    Executor(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Maps a non-success HTTP status to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 | 403 => Self::AuthenticationInvalid(status),
            412 => Self::ConcurrentModification,
            _ => Self::Http {
                status,
                message: message.into(),
            },
        }
    }

    /// Returns the HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::AuthenticationInvalid(status) => Some(*status),
            SyncError::Http { status, .. } => Some(*status),
            SyncError::ConcurrentModification => Some(412),
            _ => None,
        }
    }

    /// Returns true for programming or configuration errors.
    ///
    /// Fatal errors are never absorbed into per-item failure counts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidSessionTransition { .. }
                | SyncError::InactiveSession(_)
                | SyncError::VersionMapInvariant(_)
                | SyncError::UnversionedRecord(_)
                | SyncError::IllegalConfiguration(_)
        )
    }

    /// Returns true if this error can be retried on the next sync.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Http { status, .. } => *status >= 500 || *status == 429,
            SyncError::ConcurrentModification => true,
            SyncError::MultipleBatchesDisallowed => true,
            SyncError::StageFailed { .. } => true,
            _ => false,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::from_status(503, "unavailable").is_retryable());
        assert!(!SyncError::from_status(400, "bad").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            SyncError::from_status(401, ""),
            SyncError::AuthenticationInvalid(401)
        );
        assert_eq!(
            SyncError::from_status(403, ""),
            SyncError::AuthenticationInvalid(403)
        );
        assert_eq!(
            SyncError::from_status(412, ""),
            SyncError::ConcurrentModification
        );
        assert_eq!(SyncError::from_status(409, "dup").status(), Some(409));
    }

    #[test]
    fn fatal_errors() {
        assert!(SyncError::VersionMapInvariant("x".into()).is_fatal());
        assert!(SyncError::UnversionedRecord("g".into()).is_fatal());
        assert!(SyncError::IllegalConfiguration("x".into()).is_fatal());
        assert!(SyncError::InvalidSessionTransition {
            from: "Done".into(),
            to: "Active".into()
        }
        .is_fatal());
        assert!(!SyncError::ConcurrentModification.is_fatal());
    }

    #[test]
    fn error_display() {
        let err = SyncError::StageFailed {
            stage: "upload_deletions".into(),
            failures: 2,
        };
        assert_eq!(
            err.to_string(),
            "stage upload_deletions failed with 2 failure(s)"
        );
    }
}
