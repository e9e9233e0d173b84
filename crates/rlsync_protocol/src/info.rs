//! Server information documents and upload results.

use crate::error::ProtocolResult;
use crate::timestamp::seconds_f64_to_millis;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// The `info/collections` document: collection name to last-modified time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoCollections {
    timestamps: HashMap<String, i64>,
}

impl InfoCollections {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the JSON document (values are decimal seconds).
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let raw: HashMap<String, f64> = serde_json::from_str(json)?;
        Ok(Self {
            timestamps: raw
                .into_iter()
                .map(|(k, v)| (k, seconds_f64_to_millis(v)))
                .collect(),
        })
    }

    /// Sets a collection timestamp in milliseconds.
    pub fn with_collection(mut self, collection: impl Into<String>, millis: i64) -> Self {
        self.timestamps.insert(collection.into(), millis);
        self
    }

    /// Returns a collection's last-modified time in milliseconds.
    pub fn timestamp(&self, collection: &str) -> Option<i64> {
        self.timestamps.get(collection).copied()
    }

    /// Returns false only when the document proves `collection` has not
    /// changed after `since`.
    ///
    /// A collection absent from the document cannot be proven unchanged.
    pub fn updated_since(&self, collection: &str, since: i64) -> bool {
        match self.timestamp(collection) {
            Some(modified) => modified > since,
            None => true,
        }
    }
}

/// The `info/configuration` document: server-imposed upload limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoConfiguration {
    /// Largest request body accepted.
    pub max_request_bytes: u64,
    /// Most records in one POST.
    pub max_post_records: u64,
    /// Largest POST body.
    pub max_post_bytes: u64,
    /// Most records in one batch.
    pub max_total_records: u64,
    /// Largest total batch size.
    pub max_total_bytes: u64,
    /// Largest single record payload.
    pub max_record_payload_bytes: u64,
}

impl Default for InfoConfiguration {
    fn default() -> Self {
        Self {
            max_request_bytes: 1_052_672,
            max_post_records: 100,
            max_post_bytes: 1_048_576,
            max_total_records: 10_000,
            max_total_bytes: 104_857_600,
            max_record_payload_bytes: 262_144,
        }
    }
}

impl InfoConfiguration {
    /// Parses the JSON document, filling absent limits with defaults.
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// The body returned by a collection POST.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostResponse {
    /// New collection timestamp (decimal seconds), absent for uncommitted batches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<f64>,
    /// Ids accepted by the server.
    #[serde(default)]
    pub success: Vec<String>,
    /// Ids rejected by the server with the reasons given.
    #[serde(default)]
    pub failed: BTreeMap<String, Value>,
    /// Batch token, present while a batch is open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<String>,
}

impl PostResponse {
    /// Parses the JSON body.
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Returns `modified` in milliseconds.
    pub fn modified_millis(&self) -> Option<i64> {
        self.modified.map(seconds_f64_to_millis)
    }

    /// Returns a printable reason for a failed id.
    pub fn failure_reason(&self, id: &str) -> Option<String> {
        self.failed.get(id).map(|reason| match reason {
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("; "),
            other => other.to_string(),
        })
    }
}
