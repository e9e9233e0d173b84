//! Reading List records.
//!
//! A client record carries both local and server bookkeeping; a server record
//! only the latter. Both share a [`FieldBag`] of article attributes.

use crate::error::{ProtocolError, ProtocolResult};
use serde_json::{Map, Value};
use url::Url;

/// Field names used on the wire.
pub mod fields {
    /// Server-assigned id.
    pub const ID: &str = "id";
    /// Server modification time (ms).
    pub const LAST_MODIFIED: &str = "last_modified";
    /// Server tombstone flag.
    pub const DELETED: &str = "deleted";
    /// Article URL as saved.
    pub const URL: &str = "url";
    /// Article title as saved.
    pub const TITLE: &str = "title";
    /// Canonical URL after resolution.
    pub const RESOLVED_URL: &str = "resolved_url";
    /// Canonical title after resolution.
    pub const RESOLVED_TITLE: &str = "resolved_title";
    /// Extracted excerpt.
    pub const EXCERPT: &str = "excerpt";
    /// Unread flag.
    pub const UNREAD: &str = "unread";
    /// Favorite flag.
    pub const FAVORITE: &str = "favorite";
    /// Device that marked the article read.
    pub const MARKED_READ_BY: &str = "marked_read_by";
    /// When the article was marked read (ms).
    pub const MARKED_READ_ON: &str = "marked_read_on";
    /// Device that added the article.
    pub const ADDED_BY: &str = "added_by";
    /// When the article was added (ms).
    pub const ADDED_ON: &str = "added_on";
    /// When the server stored the article (ms).
    pub const STORED_ON: &str = "stored_on";

    /// Fields sent in a status-only patch.
    pub const STATUS_FIELDS: [&str; 4] = [UNREAD, FAVORITE, MARKED_READ_BY, MARKED_READ_ON];
    /// Fields sent in a material-change patch.
    pub const MATERIAL_FIELDS: [&str; 3] = [EXCERPT, RESOLVED_URL, RESOLVED_TITLE];
    /// Fields the server owns and clients never send.
    pub const SERVER_FIELDS: [&str; 4] = [ID, LAST_MODIFIED, DELETED, STORED_ON];
}

/// Local bookkeeping for a client-observed record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientMetadata {
    /// Local row id.
    pub id: i64,
    /// Local modification time (ms).
    pub last_modified: i64,
    /// Deleted locally, pending upload.
    pub is_deleted: bool,
    /// Archived locally.
    pub is_archived: bool,
}

/// Server bookkeeping for a server-observed record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerMetadata {
    /// Server-assigned id; `None` until first upload.
    pub guid: Option<String>,
    /// Server modification time (ms).
    pub last_modified: i64,
}

impl ServerMetadata {
    /// Creates server metadata.
    pub fn new(guid: Option<String>, last_modified: i64) -> Self {
        Self {
            guid,
            last_modified,
        }
    }
}

/// Article attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldBag(Map<String, Value>);

impl FieldBag {
    /// Creates an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing map.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Sets a field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Sets a field in place.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Returns a raw field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Returns a boolean field.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// Returns an integer field.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    /// Returns the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Projects the listed keys that are present into a JSON object.
    pub fn project(&self, keys: &[&str]) -> Map<String, Value> {
        keys.iter()
            .filter_map(|k| self.0.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect()
    }
}

/// A record as stored on this device.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientReadingListRecord {
    /// Local bookkeeping.
    pub client: ClientMetadata,
    /// Server bookkeeping (guid is `None` until first upload).
    pub server: ServerMetadata,
    /// Article attributes.
    pub fields: FieldBag,
}

impl ClientReadingListRecord {
    /// Creates a record.
    pub fn new(client: ClientMetadata, server: ServerMetadata, fields: FieldBag) -> Self {
        Self {
            client,
            server,
            fields,
        }
    }

    /// Returns the server guid.
    pub fn guid(&self) -> Option<&str> {
        self.server.guid.as_deref()
    }

    /// Returns the article URL.
    pub fn url(&self) -> Option<&str> {
        self.fields.get_str(fields::URL)
    }

    /// Returns the resolved URL.
    pub fn resolved_url(&self) -> Option<&str> {
        self.fields.get_str(fields::RESOLVED_URL)
    }

    /// Returns the title.
    pub fn title(&self) -> Option<&str> {
        self.fields.get_str(fields::TITLE)
    }

    /// Returns the unread flag, defaulting to unread.
    pub fn is_unread(&self) -> bool {
        self.fields.get_bool(fields::UNREAD).unwrap_or(true)
    }

    /// Returns the favorite flag.
    pub fn is_favorite(&self) -> bool {
        self.fields.get_bool(fields::FAVORITE).unwrap_or(false)
    }

    /// Rebuilds this record from the server's acknowledgment.
    ///
    /// Keeps this record's client metadata; takes guid, timestamp and fields
    /// from `server`.
    pub fn given_server_record(&self, server: &ServerReadingListRecord) -> ClientReadingListRecord {
        ClientReadingListRecord {
            client: self.client,
            server: server.server.clone(),
            fields: server.fields.clone(),
        }
    }

    /// Body for creating this record on the server.
    pub fn to_upload_json(&self) -> Value {
        let map: Map<String, Value> = self
            .fields
            .as_map()
            .iter()
            .filter(|(k, _)| !fields::SERVER_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }

    /// Body for a status-only patch.
    pub fn to_status_patch_json(&self) -> Value {
        Value::Object(self.fields.project(&fields::STATUS_FIELDS))
    }

    /// Body for a material-change patch.
    pub fn to_material_patch_json(&self) -> Value {
        Value::Object(self.fields.project(&fields::MATERIAL_FIELDS))
    }
}

/// A record as the server reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerReadingListRecord {
    /// Server bookkeeping.
    pub server: ServerMetadata,
    /// Server tombstone flag, seen on incremental downloads.
    pub deleted: bool,
    /// Article attributes.
    pub fields: FieldBag,
}

impl ServerReadingListRecord {
    /// Creates a live server record.
    pub fn new(guid: impl Into<String>, last_modified: i64, fields: FieldBag) -> Self {
        Self {
            server: ServerMetadata::new(Some(guid.into()), last_modified),
            deleted: false,
            fields,
        }
    }

    /// Returns the guid.
    pub fn guid(&self) -> Option<&str> {
        self.server.guid.as_deref()
    }

    /// Parses a server JSON object.
    pub fn from_json(value: Value) -> ProtocolResult<Self> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::InvalidRecord(
                "reading list record is not an object".into(),
            ));
        };
        let guid = match map.remove(fields::ID) {
            Some(Value::String(id)) => id,
            _ => {
                return Err(ProtocolError::InvalidRecord(
                    "reading list record has no id".into(),
                ))
            }
        };
        let last_modified = map
            .remove(fields::LAST_MODIFIED)
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let deleted = matches!(map.remove(fields::DELETED), Some(Value::Bool(true)));

        Ok(Self {
            server: ServerMetadata::new(Some(guid), last_modified),
            deleted,
            fields: FieldBag::from_map(map),
        })
    }

    /// Serializes to the server JSON shape.
    pub fn to_json(&self) -> Value {
        let mut map = self.fields.as_map().clone();
        if let Some(guid) = &self.server.guid {
            map.insert(fields::ID.into(), Value::String(guid.clone()));
        }
        map.insert(fields::LAST_MODIFIED.into(), Value::from(self.server.last_modified));
        if self.deleted {
            map.insert(fields::DELETED.into(), Value::Bool(true));
        }
        Value::Object(map)
    }
}

/// Additive query builder for Reading List collection requests.
///
/// ```
/// use rlsync_protocol::ReadingListQuery;
///
/// let query = ReadingListQuery::new().since(1234).unread(true).not_deleted();
/// assert_eq!(query.to_query_string(), "_since=1234&unread=true&not_deleted=true");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadingListQuery {
    params: Vec<(String, String)>,
}

impl ReadingListQuery {
    /// Creates an empty query.
    pub fn new() -> Self {
        Self::default()
    }

    fn add(mut self, key: String, value: String) -> Self {
        self.params.push((key, value));
        self
    }

    /// Filters by unread state.
    pub fn unread(self, unread: bool) -> Self {
        self.add(fields::UNREAD.into(), unread.to_string())
    }

    /// Requires `attr >= value`.
    pub fn min(self, attr: &str, value: impl ToString) -> Self {
        self.add(format!("min_{}", attr), value.to_string())
    }

    /// Requires `attr <= value`.
    pub fn max(self, attr: &str, value: impl ToString) -> Self {
        self.add(format!("max_{}", attr), value.to_string())
    }

    /// Requires `attr != value`.
    pub fn not(self, attr: &str, value: impl ToString) -> Self {
        self.add(format!("not_{}", attr), value.to_string())
    }

    /// Restricts to changes after `millis`.
    pub fn since(self, millis: i64) -> Self {
        self.add("_since".into(), millis.to_string())
    }

    /// Excludes tombstones.
    pub fn not_deleted(self) -> Self {
        self.add("not_deleted".into(), "true".into())
    }

    /// Caps the number of returned items.
    pub fn limit(self, limit: u64) -> Self {
        self.add("_limit".into(), limit.to_string())
    }

    /// Returns the parameters in insertion order.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Returns the `_since` bound, if any.
    pub fn since_value(&self) -> Option<i64> {
        self.params
            .iter()
            .find(|(k, _)| k == "_since")
            .and_then(|(_, v)| v.parse().ok())
    }

    /// Renders the encoded query string.
    pub fn to_query_string(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.params.iter())
            .finish()
    }

    /// Applies the query to `base`, replacing any existing query string.
    pub fn to_url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        if self.params.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&self.to_query_string()));
        }
        url
    }

    /// Parses a query from `url`.
    pub fn from_url(url: &Url) -> Self {
        Self {
            params: url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client_record() -> ClientReadingListRecord {
        ClientReadingListRecord::new(
            ClientMetadata {
                id: 7,
                last_modified: 100,
                is_deleted: false,
                is_archived: false,
            },
            ServerMetadata::default(),
            FieldBag::new()
                .with(fields::URL, "http://example.com/a")
                .with(fields::TITLE, "A")
                .with(fields::UNREAD, false)
                .with(fields::EXCERPT, "hello")
                .with(fields::STORED_ON, 5),
        )
    }

    #[test]
    fn given_server_record_merges_metadata() {
        let local = client_record();
        let server = ServerReadingListRecord::new(
            "g1",
            2_000,
            FieldBag::new().with(fields::URL, "http://example.com/a"),
        );
        let merged = local.given_server_record(&server);
        assert_eq!(merged.client, local.client);
        assert_eq!(merged.guid(), Some("g1"));
        assert_eq!(merged.server.last_modified, 2_000);
        assert_eq!(merged.fields, server.fields);
    }

    #[test]
    fn projections() {
        let record = client_record();
        assert_eq!(record.to_status_patch_json(), json!({"unread": false}));
        assert_eq!(record.to_material_patch_json(), json!({"excerpt": "hello"}));
        let upload = record.to_upload_json();
        assert!(upload.get("stored_on").is_none());
        assert_eq!(upload["title"], "A");
    }

    #[test]
    fn server_record_json() {
        let value = json!({"id": "g", "last_modified": 55, "url": "u", "deleted": true});
        let record = ServerReadingListRecord::from_json(value.clone()).unwrap();
        assert_eq!(record.guid(), Some("g"));
        assert_eq!(record.server.last_modified, 55);
        assert!(record.deleted);
        assert_eq!(record.fields.get_str("url"), Some("u"));
        assert_eq!(record.to_json(), value);
    }

    #[test]
    fn server_record_requires_id() {
        assert!(ServerReadingListRecord::from_json(json!({"url": "u"})).is_err());
        assert!(ServerReadingListRecord::from_json(json!([1])).is_err());
    }

    #[test]
    fn query_builder_is_additive() {
        let query = ReadingListQuery::new()
            .min("added_on", 10)
            .max("added_on", 20)
            .not("added_by", "me")
            .limit(5);
        assert_eq!(
            query.to_query_string(),
            "min_added_on=10&max_added_on=20&not_added_by=me&_limit=5"
        );
        let base = Url::parse("https://rl.example.com/v1/articles").unwrap();
        let parsed = ReadingListQuery::from_url(&query.to_url(&base));
        assert_eq!(parsed, query);
        assert_eq!(ReadingListQuery::new().since(9).since_value(), Some(9));
    }

    #[test]
    fn defaults() {
        let record = ClientReadingListRecord::new(
            ClientMetadata::default(),
            ServerMetadata::default(),
            FieldBag::new(),
        );
        assert!(record.is_unread());
        assert!(!record.is_favorite());
        assert!(record.guid().is_none());
    }
}
