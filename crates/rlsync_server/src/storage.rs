//! In-memory Sync collection storage.
//!
//! Collections hold wire records keyed by id. Every write stamps the records
//! it touches and the collection with one fresh server timestamp. Uploads can
//! be staged in batches and applied atomically at commit.

use crate::clock::ServerClock;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use parking_lot::RwLock;
use rlsync_protocol::timestamp::millis_to_decimal_seconds;
use rlsync_protocol::{BatchParam, CollectionQuery, PostResponse, Record, SortOrder, WireRecord};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// A record as the server keeps it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Record id.
    pub id: String,
    /// Server modification time (ms).
    pub modified: i64,
    /// JSON-encoded payload, opaque to the server.
    pub payload: String,
    /// Sort index.
    pub sortindex: Option<i64>,
    /// Time-to-live in seconds.
    pub ttl: Option<u64>,
}

impl StoredRecord {
    /// Returns the wire envelope, `modified` in decimal seconds.
    pub fn to_wire(&self) -> WireRecord {
        WireRecord {
            id: self.id.clone(),
            modified: Some(self.modified as f64 / 1000.0),
            payload: self.payload.clone(),
            sortindex: self.sortindex,
            ttl: self.ttl,
        }
    }
}

/// One page of a collection GET.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Records on this page, in the requested order.
    pub records: Vec<StoredRecord>,
    /// Offset token for the following page.
    pub next_offset: Option<String>,
    /// The collection's modification time (ms), zero if it does not exist.
    pub last_modified: i64,
}

/// The result of an upload POST.
#[derive(Debug, Clone, PartialEq)]
pub struct PostOutcome {
    /// 200 when applied, 202 when staged in an open batch.
    pub status: u16,
    /// Response body.
    pub response: PostResponse,
}

#[derive(Debug, Default)]
struct Collection {
    records: BTreeMap<String, StoredRecord>,
    modified: i64,
}

#[derive(Debug)]
struct Batch {
    collection: String,
    records: Vec<WireRecord>,
    bytes: u64,
}

#[derive(Debug, Default)]
struct State {
    collections: HashMap<String, Collection>,
    batches: HashMap<String, Batch>,
}

impl State {
    fn modified(&self, collection: &str) -> i64 {
        self.collections.get(collection).map_or(0, |c| c.modified)
    }

    fn check_unmodified(&self, collection: &str, since: Option<i64>) -> ServerResult<()> {
        let modified = self.modified(collection);
        match since {
            Some(since) if modified > since => {
                Err(ServerError::PreconditionFailed { modified, since })
            }
            _ => Ok(()),
        }
    }

    fn apply(&mut self, collection: &str, records: Vec<WireRecord>, modified: i64) {
        let target = self.collections.entry(collection.to_string()).or_default();
        for wire in records {
            target.records.insert(
                wire.id.clone(),
                StoredRecord {
                    id: wire.id,
                    modified,
                    payload: wire.payload,
                    sortindex: wire.sortindex,
                    ttl: wire.ttl,
                },
            );
        }
        target.modified = modified;
    }
}

/// All collections of one storage node.
pub struct CollectionStore {
    config: ServerConfig,
    clock: Arc<ServerClock>,
    state: RwLock<State>,
}

impl CollectionStore {
    /// Creates an empty store.
    pub fn new(config: ServerConfig, clock: Arc<ServerClock>) -> Self {
        Self {
            config,
            clock,
            state: RwLock::new(State::default()),
        }
    }

    /// Returns a collection's modification time (ms), zero if absent.
    pub fn modified(&self, collection: &str) -> i64 {
        self.state.read().modified(collection)
    }

    /// Fails with 412 semantics if `collection` changed after `since`.
    pub fn check_unmodified(&self, collection: &str, since: Option<i64>) -> ServerResult<()> {
        self.state.read().check_unmodified(collection, since)
    }

    /// Every non-empty collection with its modification time (ms).
    pub fn info_collections(&self) -> BTreeMap<String, i64> {
        self.state
            .read()
            .collections
            .iter()
            .filter(|(_, c)| !c.records.is_empty())
            .map(|(name, c)| (name.clone(), c.modified))
            .collect()
    }

    /// Number of records in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.state
            .read()
            .collections
            .get(collection)
            .map_or(0, |c| c.records.len())
    }

    /// Number of open batches.
    pub fn open_batches(&self) -> usize {
        self.state.read().batches.len()
    }

    /// Returns one record.
    pub fn get_record(&self, collection: &str, id: &str) -> ServerResult<StoredRecord> {
        self.state
            .read()
            .collections
            .get(collection)
            .and_then(|c| c.records.get(id))
            .cloned()
            .ok_or_else(|| ServerError::NotFound(format!("{}/{}", collection, id)))
    }

    /// Answers a collection GET.
    ///
    /// Offsets are positions in the filtered, sorted result; they stay valid
    /// as long as the collection does not change, which clients guard with
    /// `X-If-Unmodified-Since`.
    pub fn get(&self, collection: &str, query: &CollectionQuery) -> ServerResult<Page> {
        let state = self.state.read();
        let Some(target) = state.collections.get(collection) else {
            return Ok(Page::default());
        };

        let ids = query.ids_value();
        let mut matches: Vec<&StoredRecord> = target
            .records
            .values()
            .filter(|r| query.newer_millis().map_or(true, |newer| r.modified > newer))
            .filter(|r| ids.is_empty() || ids.contains(&r.id))
            .collect();
        match query.sort_value() {
            Some(SortOrder::Oldest) => matches.sort_by(|a, b| a.modified.cmp(&b.modified).then(a.id.cmp(&b.id))),
            Some(SortOrder::Newest) => matches.sort_by(|a, b| b.modified.cmp(&a.modified).then(a.id.cmp(&b.id))),
            Some(SortOrder::Index) => matches.sort_by(|a, b| b.sortindex.cmp(&a.sortindex).then(a.id.cmp(&b.id))),
            None => {}
        }

        let start = match query.offset_value() {
            Some(offset) => offset
                .parse::<usize>()
                .map_err(|_| ServerError::InvalidRequest(format!("bad offset: {}", offset)))?,
            None => 0,
        };
        let limit = query
            .limit_value()
            .unwrap_or(self.config.max_page_size)
            .min(self.config.max_page_size) as usize;
        let end = start.saturating_add(limit).min(matches.len());
        let records: Vec<StoredRecord> = matches
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|r| (*r).clone())
            .collect();
        let next_offset = (end < matches.len()).then(|| end.to_string());

        debug!(collection, start, returned = records.len(), total = matches.len(), "collection page");
        Ok(Page {
            records,
            next_offset,
            last_modified: target.modified,
        })
    }

    /// Answers an upload POST.
    ///
    /// Oversized or malformed records are reported in `failed`; the rest go
    /// straight into the collection, or into a batch when `batch` is given
    /// and batching is enabled.
    pub fn post(
        &self,
        collection: &str,
        records: Vec<WireRecord>,
        body_bytes: u64,
        batch: Option<&BatchParam>,
        commit: bool,
        unmodified_since: Option<i64>,
    ) -> ServerResult<PostOutcome> {
        let limits = &self.config.limits;
        if records.len() as u64 > limits.max_post_records {
            return Err(ServerError::LimitExceeded {
                limit: "max_post_records",
                actual: records.len() as u64,
                max: limits.max_post_records,
            });
        }
        if body_bytes > limits.max_post_bytes.min(limits.max_request_bytes) {
            return Err(ServerError::LimitExceeded {
                limit: "max_post_bytes",
                actual: body_bytes,
                max: limits.max_post_bytes.min(limits.max_request_bytes),
            });
        }

        let mut response = PostResponse::default();
        let mut accepted = Vec::with_capacity(records.len());
        for wire in records {
            if wire.id.is_empty() || wire.id.len() > 64 {
                response
                    .failed
                    .insert(wire.id.clone(), Value::String("invalid id".into()));
            } else if wire.payload.len() as u64 > limits.max_record_payload_bytes {
                response
                    .failed
                    .insert(wire.id.clone(), Value::String("retry bytes".into()));
            } else {
                response.success.push(wire.id.clone());
                accepted.push(wire);
            }
        }

        let mut state = self.state.write();
        state.check_unmodified(collection, unmodified_since)?;

        let batch = batch.filter(|_| self.config.batch_uploads);
        let Some(batch) = batch else {
            let modified = self.clock.tick();
            state.apply(collection, accepted, modified);
            response.modified = Some(modified as f64 / 1000.0);
            info!(collection, stored = response.success.len(), failed = response.failed.len(), "records stored");
            return Ok(PostOutcome {
                status: 200,
                response,
            });
        };

        let token = match batch {
            BatchParam::Start => {
                let token = uuid::Uuid::new_v4().simple().to_string();
                state.batches.insert(
                    token.clone(),
                    Batch {
                        collection: collection.to_string(),
                        records: Vec::new(),
                        bytes: 0,
                    },
                );
                debug!(collection, %token, "batch opened");
                token
            }
            BatchParam::Token(token) => match state.batches.get(token) {
                Some(open) if open.collection == collection => token.clone(),
                _ => return Err(ServerError::UnknownBatch(token.clone())),
            },
        };

        let open = state
            .batches
            .get_mut(&token)
            .ok_or_else(|| ServerError::UnknownBatch(token.clone()))?;
        let total_records = (open.records.len() + accepted.len()) as u64;
        if total_records > limits.max_total_records {
            return Err(ServerError::LimitExceeded {
                limit: "max_total_records",
                actual: total_records,
                max: limits.max_total_records,
            });
        }
        let total_bytes = open.bytes + body_bytes;
        if total_bytes > limits.max_total_bytes {
            return Err(ServerError::LimitExceeded {
                limit: "max_total_bytes",
                actual: total_bytes,
                max: limits.max_total_bytes,
            });
        }
        open.records.extend(accepted);
        open.bytes = total_bytes;

        if !commit {
            response.batch = Some(token);
            return Ok(PostOutcome {
                status: 202,
                response,
            });
        }

        let staged = state
            .batches
            .remove(&token)
            .map(|b| b.records)
            .unwrap_or_default();
        let modified = self.clock.tick();
        let applied = staged.len();
        state.apply(collection, staged, modified);
        response.modified = Some(modified as f64 / 1000.0);
        info!(collection, %token, applied, modified = %millis_to_decimal_seconds(modified), "batch committed");
        Ok(PostOutcome {
            status: 200,
            response,
        })
    }

    /// Stores one record, returning the new collection timestamp (ms).
    pub fn put(
        &self,
        collection: &str,
        wire: WireRecord,
        unmodified_since: Option<i64>,
    ) -> ServerResult<i64> {
        if wire.payload.len() as u64 > self.config.limits.max_record_payload_bytes {
            return Err(ServerError::LimitExceeded {
                limit: "max_record_payload_bytes",
                actual: wire.payload.len() as u64,
                max: self.config.limits.max_record_payload_bytes,
            });
        }
        let mut state = self.state.write();
        state.check_unmodified(collection, unmodified_since)?;
        let modified = self.clock.tick();
        state.apply(collection, vec![wire], modified);
        Ok(modified)
    }

    /// Deletes the given ids, or the whole collection when `ids` is empty.
    /// Returns the new timestamp (ms).
    pub fn delete(
        &self,
        collection: &str,
        ids: &[String],
        unmodified_since: Option<i64>,
    ) -> ServerResult<i64> {
        let mut state = self.state.write();
        state.check_unmodified(collection, unmodified_since)?;
        let modified = self.clock.tick();
        if ids.is_empty() {
            state.collections.remove(collection);
            state.batches.retain(|_, b| b.collection != collection);
            info!(collection, "collection deleted");
        } else if let Some(target) = state.collections.get_mut(collection) {
            for id in ids {
                target.records.remove(id);
            }
            target.modified = modified;
        }
        Ok(modified)
    }

    /// Writes `record` directly, as another client would have.
    pub fn insert(&self, record: &Record) -> ServerResult<i64> {
        let wire = record.to_wire()?;
        self.put(&record.collection, wire, None)
    }

    /// Returns a collection's records decoded, ordered by id.
    pub fn records(&self, collection: &str) -> ServerResult<Vec<Record>> {
        let state = self.state.read();
        let Some(target) = state.collections.get(collection) else {
            return Ok(Vec::new());
        };
        target
            .records
            .values()
            .map(|r| Ok(Record::from_wire(collection, r.to_wire())?))
            .collect()
    }
}
