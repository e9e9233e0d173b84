//! Session checkpoints.

use crate::error::ProtocolResult;
use serde::{Deserialize, Serialize};

/// The checkpoint carried from one session to the next.
///
/// `timestamp` is the completion time of the last successful sync. It is
/// loaded when a session starts and only advanced when a session finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySessionBundle {
    /// Last successful sync completion time, in milliseconds.
    pub timestamp: i64,
}

impl RepositorySessionBundle {
    /// Creates a bundle at `timestamp`.
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    /// Moves the timestamp forward; earlier values are ignored.
    pub fn bump_timestamp(&mut self, timestamp: i64) {
        if timestamp > self.timestamp {
            self.timestamp = timestamp;
        }
    }

    /// Serializes to JSON.
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes from JSON.
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
