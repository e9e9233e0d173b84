//! Synchronized records and their wire envelope.

use crate::error::{ProtocolError, ProtocolResult};
use crate::timestamp::{millis_to_decimal_seconds, seconds_f64_to_millis};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A record as exchanged between a local store and a server collection.
///
/// `guid` is `None` until the server has accepted the record once.
/// `android_id` is the local row id and is `None` for records that have
/// only been observed on the server. `local_version` is the local store's
/// change counter, required when versioned sync is in use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Server-assigned identifier.
    pub guid: Option<String>,
    /// Collection this record belongs to.
    pub collection: String,
    /// Last modification time in milliseconds.
    pub last_modified: i64,
    /// Local row id.
    pub android_id: Option<i64>,
    /// Whether this record is a tombstone.
    pub deleted: bool,
    /// Local change counter at the time the record was read.
    pub local_version: Option<i64>,
    /// Server sort index.
    pub sort_index: Option<i64>,
    /// Server time-to-live in seconds.
    pub ttl: Option<u64>,
    /// Cleartext payload fields.
    pub payload: Map<String, Value>,
}

impl Record {
    /// Creates an empty, live record in a collection.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            guid: None,
            collection: collection.into(),
            last_modified: 0,
            android_id: None,
            deleted: false,
            local_version: None,
            sort_index: None,
            ttl: None,
            payload: Map::new(),
        }
    }

    /// Creates a tombstone for `guid`.
    pub fn tombstone(collection: impl Into<String>, guid: impl Into<String>, last_modified: i64) -> Self {
        Self {
            guid: Some(guid.into()),
            last_modified,
            deleted: true,
            ..Self::new(collection)
        }
    }

    /// Sets the guid.
    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = Some(guid.into());
        self
    }

    /// Sets the last-modified time.
    pub fn with_last_modified(mut self, last_modified: i64) -> Self {
        self.last_modified = last_modified;
        self
    }

    /// Sets the local row id.
    pub fn with_android_id(mut self, android_id: i64) -> Self {
        self.android_id = Some(android_id);
        self
    }

    /// Sets the local version.
    pub fn with_local_version(mut self, version: i64) -> Self {
        self.local_version = Some(version);
        self
    }

    /// Sets a payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Returns the guid, or an error if the record has never been uploaded.
    pub fn require_guid(&self) -> ProtocolResult<&str> {
        self.guid.as_deref().ok_or(ProtocolError::MissingGuid)
    }

    /// Returns true if both records carry the same semantic content.
    ///
    /// Bookkeeping fields (guid, timestamps, local ids, versions) are ignored.
    /// Two tombstones are always payload-equal.
    pub fn equal_payloads(&self, other: &Record) -> bool {
        if self.deleted != other.deleted {
            return false;
        }
        self.deleted || self.payload == other.payload
    }

    /// Returns a copy carrying `guid` and `android_id` instead of its own.
    pub fn copy_with_ids(&self, guid: Option<String>, android_id: Option<i64>) -> Record {
        Record {
            guid,
            android_id,
            ..self.clone()
        }
    }

    /// Builds a record from a wire envelope.
    pub fn from_wire(collection: impl Into<String>, wire: WireRecord) -> ProtocolResult<Self> {
        let mut payload: Map<String, Value> = if wire.payload.trim().is_empty() {
            Map::new()
        } else {
            serde_json::from_str(&wire.payload)?
        };
        let deleted = matches!(payload.remove("deleted"), Some(Value::Bool(true)));
        if let Some(Value::String(inner_id)) = payload.remove("id") {
            if inner_id != wire.id {
                return Err(ProtocolError::InvalidRecord(format!(
                    "payload id {} does not match record id {}",
                    inner_id, wire.id
                )));
            }
        }

        Ok(Self {
            guid: Some(wire.id),
            collection: collection.into(),
            last_modified: wire.modified.map(seconds_f64_to_millis).unwrap_or(0),
            android_id: None,
            deleted,
            local_version: None,
            sort_index: wire.sortindex,
            ttl: wire.ttl,
            payload: if deleted { Map::new() } else { payload },
        })
    }

    /// Parses one line of a `application/newlines` collection response.
    pub fn from_wire_line(collection: impl Into<String>, line: &str) -> ProtocolResult<Self> {
        let wire: WireRecord = serde_json::from_str(line)?;
        Self::from_wire(collection, wire)
    }

    /// Converts this record into its wire envelope for upload.
    pub fn to_wire(&self) -> ProtocolResult<WireRecord> {
        let guid = self.require_guid()?.to_string();
        let mut payload = if self.deleted {
            Map::new()
        } else {
            self.payload.clone()
        };
        payload.insert("id".into(), Value::String(guid.clone()));
        if self.deleted {
            payload.insert("deleted".into(), Value::Bool(true));
        }

        Ok(WireRecord {
            id: guid,
            modified: None,
            payload: serde_json::to_string(&payload)?,
            sortindex: self.sort_index,
            ttl: self.ttl,
        })
    }

    /// Serializes this record's wire envelope to a JSON string.
    pub fn to_wire_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(&self.to_wire()?)?)
    }

    /// Renders `last_modified` as wire decimal seconds.
    pub fn modified_decimal_seconds(&self) -> String {
        millis_to_decimal_seconds(self.last_modified)
    }
}

/// The JSON envelope a record travels in (a "WBO").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    /// Record identifier.
    pub id: String,
    /// Server modification time in decimal seconds, absent on upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<f64>,
    /// JSON-encoded cleartext payload.
    #[serde(default)]
    pub payload: String,
    /// Server sort index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sortindex: Option<i64>,
    /// Time-to-live in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}
