//! Error types for the reference server.

use rlsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while handling a request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No or malformed credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Valid credentials that do not grant access.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// No such resource.
    #[error("not found: {0}")]
    NotFound(String),

    /// The write clashes with an existing resource.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The resource changed after the client's precondition.
    #[error("modified at {modified}, after precondition {since}")]
    PreconditionFailed {
        /// Current modification time (ms).
        modified: i64,
        /// The client's precondition (ms).
        since: i64,
    },

    /// A request exceeded a configured limit.
    #[error("{limit} exceeded: {actual} > {max}")]
    LimitExceeded {
        /// Which limit.
        limit: &'static str,
        /// The request's value.
        actual: u64,
        /// The configured maximum.
        max: u64,
    },

    /// The resource does not support the method.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// A batch token that is not open.
    #[error("unknown batch: {0}")]
    UnknownBatch(String),

    /// Request body or query could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns the HTTP status for this error.
    pub fn status(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_)
            | ServerError::UnknownBatch(_)
            | ServerError::Protocol(_) => 400,
            ServerError::LimitExceeded { limit, .. } if limit.ends_with("bytes") => 413,
            ServerError::LimitExceeded { .. } => 400,
            ServerError::AuthenticationFailed(_) => 401,
            ServerError::NotAuthorized(_) => 403,
            ServerError::NotFound(_) => 404,
            ServerError::MethodNotAllowed(_) => 405,
            ServerError::Conflict(_) => 409,
            ServerError::PreconditionFailed { .. } => 412,
            ServerError::Internal(_) => 500,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status() >= 500
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Protocol(ProtocolError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
    }

    #[test]
    fn statuses() {
        assert_eq!(ServerError::NotFound("a".into()).status(), 404);
        assert_eq!(ServerError::Conflict("a".into()).status(), 409);
        assert_eq!(
            ServerError::PreconditionFailed { modified: 2, since: 1 }.status(),
            412
        );
        let records = ServerError::LimitExceeded {
            limit: "max_post_records",
            actual: 3,
            max: 2,
        };
        assert_eq!(records.status(), 400);
        let bytes = ServerError::LimitExceeded {
            limit: "max_post_bytes",
            actual: 3,
            max: 2,
        };
        assert_eq!(bytes.status(), 413);
    }

    #[test]
    fn error_display() {
        let err = ServerError::PreconditionFailed {
            modified: 10,
            since: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains("5"));
    }
}
