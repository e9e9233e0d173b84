//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding wire data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// A JSON document could not be parsed or produced.
    #[error("json error: {0}")]
    Json(String),

    /// A record is structurally invalid for the requested operation.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A record must carry a GUID for this operation.
    #[error("record has no guid")]
    MissingGuid,

    /// A header value could not be interpreted.
    #[error("invalid header {name}: {value}")]
    InvalidHeader {
        /// Header name.
        name: String,
        /// Offending value.
        value: String,
    },

    /// A timestamp string could not be parsed.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A URL could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Reading a response body failed.
    #[error("body read failed: {0}")]
    Body(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Json(err.to_string())
    }
}

impl From<url::ParseError> for ProtocolError {
    fn from(err: url::ParseError) -> Self {
        ProtocolError::InvalidUrl(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_errors_convert() {
        let err: ProtocolError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn header_error_display() {
        let err = ProtocolError::InvalidHeader {
            name: "X-Weave-Timestamp".into(),
            value: "abc".into(),
        };
        assert_eq!(err.to_string(), "invalid header X-Weave-Timestamp: abc");
    }
}
