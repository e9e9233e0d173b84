//! In-memory Reading List `articles` collection.

use crate::clock::ServerClock;
use crate::error::{ServerError, ServerResult};
use parking_lot::RwLock;
use rlsync_protocol::{fields, FieldBag, ReadingListQuery, ServerReadingListRecord};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// How a create request was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Created {
    /// A new article (201).
    New(ServerReadingListRecord),
    /// An identical live article already existed (200).
    Existing(ServerReadingListRecord),
}

impl Created {
    /// Returns the HTTP status.
    pub fn status(&self) -> u16 {
        match self {
            Created::New(_) => 201,
            Created::Existing(_) => 200,
        }
    }

    /// Returns the article.
    pub fn record(&self) -> &ServerReadingListRecord {
        match self {
            Created::New(record) | Created::Existing(record) => record,
        }
    }
}

/// The result of a collection GET.
#[derive(Debug, Clone, PartialEq)]
pub enum Listing {
    /// Nothing changed after `If-Modified-Since` (304).
    NotModified,
    /// Matching articles, oldest change first.
    Items {
        /// The articles.
        items: Vec<ServerReadingListRecord>,
        /// Collection timestamp (ms).
        last_modified: i64,
        /// Number of matches before `_limit`.
        total: usize,
    },
}

#[derive(Debug, Clone)]
struct Article {
    id: String,
    last_modified: i64,
    deleted: bool,
    fields: Map<String, Value>,
}

impl Article {
    fn dedupe_key(&self) -> Option<&str> {
        dedupe_key(&self.fields)
    }

    fn to_record(&self) -> ServerReadingListRecord {
        let mut record = ServerReadingListRecord::new(
            self.id.clone(),
            self.last_modified,
            FieldBag::from_map(self.fields.clone()),
        );
        record.deleted = self.deleted;
        record
    }
}

fn dedupe_key(map: &Map<String, Value>) -> Option<&str> {
    map.get(fields::RESOLVED_URL)
        .or_else(|| map.get(fields::URL))
        .and_then(Value::as_str)
}

/// Client-writable fields of a request body.
fn writable_fields(body: Value) -> ServerResult<Map<String, Value>> {
    let Value::Object(mut map) = body else {
        return Err(ServerError::InvalidRequest("body is not an object".into()));
    };
    for field in fields::SERVER_FIELDS {
        map.remove(field);
    }
    Ok(map)
}

fn compare(value: &Value, bound: &str) -> Option<Ordering> {
    match (value, bound.parse::<i64>()) {
        (Value::Number(n), Ok(bound)) => n.as_i64().map(|n| n.cmp(&bound)),
        (Value::String(s), _) => Some(s.as_str().cmp(bound)),
        (Value::Bool(b), _) => Some(b.to_string().as_str().cmp(bound)),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct State {
    articles: BTreeMap<String, Article>,
    last_modified: i64,
}

impl State {
    fn live_with_key(&self, key: &str, except: Option<&str>) -> Option<&Article> {
        self.articles.values().find(|a| {
            !a.deleted && Some(a.id.as_str()) != except && a.dedupe_key() == Some(key)
        })
    }
}

/// The `articles` collection.
pub struct ArticleStore {
    clock: Arc<ServerClock>,
    state: RwLock<State>,
}

impl ArticleStore {
    /// Creates an empty collection.
    pub fn new(clock: Arc<ServerClock>) -> Self {
        Self {
            clock,
            state: RwLock::new(State::default()),
        }
    }

    /// Collection timestamp (ms).
    pub fn last_modified(&self) -> i64 {
        self.state.read().last_modified
    }

    /// Number of live articles.
    pub fn live_count(&self) -> usize {
        self.state.read().articles.values().filter(|a| !a.deleted).count()
    }

    /// Returns an article, tombstones included.
    pub fn get(&self, id: &str) -> ServerResult<ServerReadingListRecord> {
        self.state
            .read()
            .articles
            .get(id)
            .map(Article::to_record)
            .ok_or_else(|| ServerError::NotFound(format!("article {}", id)))
    }

    /// Creates an article.
    ///
    /// An article whose resolved URL (or URL) matches a live article is
    /// answered with that article if the fields are identical, and refused
    /// with a conflict otherwise.
    pub fn create(&self, body: Value) -> ServerResult<Created> {
        let mut attributes = writable_fields(body)?;
        if !attributes.get(fields::URL).is_some_and(Value::is_string) {
            return Err(ServerError::InvalidRequest("article has no url".into()));
        }
        attributes
            .entry(fields::UNREAD)
            .or_insert(Value::Bool(true));

        let mut state = self.state.write();
        if let Some(key) = dedupe_key(&attributes) {
            if let Some(existing) = state.live_with_key(key, None) {
                let mut stripped = existing.fields.clone();
                stripped.remove(fields::STORED_ON);
                if stripped == attributes {
                    debug!(id = %existing.id, "article already exists");
                    return Ok(Created::Existing(existing.to_record()));
                }
                return Err(ServerError::Conflict(format!(
                    "{} is already saved as {}",
                    key, existing.id
                )));
            }
        }

        let now = self.clock.tick();
        attributes.insert(fields::STORED_ON.into(), Value::from(now));
        let article = Article {
            id: uuid::Uuid::new_v4().simple().to_string(),
            last_modified: now,
            deleted: false,
            fields: attributes,
        };
        let record = article.to_record();
        info!(id = %article.id, "article created");
        state.articles.insert(article.id.clone(), article);
        state.last_modified = now;
        Ok(Created::New(record))
    }

    /// Merges `body` into a live article.
    ///
    /// With `unmodified_since`, refuses if the article changed after it.
    pub fn patch(
        &self,
        id: &str,
        body: Value,
        unmodified_since: Option<i64>,
    ) -> ServerResult<ServerReadingListRecord> {
        let changes = writable_fields(body)?;
        let mut state = self.state.write();
        let current = state
            .articles
            .get(id)
            .filter(|a| !a.deleted)
            .ok_or_else(|| ServerError::NotFound(format!("article {}", id)))?;
        if let Some(since) = unmodified_since {
            if current.last_modified > since {
                return Err(ServerError::PreconditionFailed {
                    modified: current.last_modified,
                    since,
                });
            }
        }

        let mut merged = current.fields.clone();
        merged.extend(changes);
        if let Some(key) = dedupe_key(&merged) {
            if let Some(other) = state.live_with_key(key, Some(id)) {
                return Err(ServerError::Conflict(format!(
                    "{} is already saved as {}",
                    key, other.id
                )));
            }
        }

        let now = self.clock.tick();
        state.last_modified = now;
        let article = state
            .articles
            .get_mut(id)
            .ok_or_else(|| ServerError::NotFound(format!("article {}", id)))?;
        article.fields = merged;
        article.last_modified = now;
        debug!(%id, "article patched");
        Ok(article.to_record())
    }

    /// Replaces a live article with a tombstone.
    pub fn delete(&self, id: &str) -> ServerResult<ServerReadingListRecord> {
        let mut state = self.state.write();
        let now = self.clock.tick();
        let article = state
            .articles
            .get_mut(id)
            .filter(|a| !a.deleted)
            .ok_or_else(|| ServerError::NotFound(format!("article {}", id)))?;
        article.deleted = true;
        article.fields.clear();
        article.last_modified = now;
        let record = article.to_record();
        state.last_modified = now;
        info!(%id, "article deleted");
        Ok(record)
    }

    /// Lists articles matching `query`.
    ///
    /// Tombstones are only reported to incremental (`_since`) requests.
    pub fn list(
        &self,
        query: &ReadingListQuery,
        if_modified_since: Option<i64>,
    ) -> ServerResult<Listing> {
        let state = self.state.read();
        if let Some(since) = if_modified_since {
            if state.last_modified <= since {
                return Ok(Listing::NotModified);
            }
        }

        let since = query.since_value();
        let mut limit: Option<usize> = None;
        let mut items: Vec<&Article> = state
            .articles
            .values()
            .filter(|a| since.map_or(!a.deleted, |since| a.last_modified > since))
            .collect();

        for (key, value) in query.params() {
            match key.as_str() {
                "_since" => {}
                "_limit" => {
                    limit = Some(value.parse().map_err(|_| {
                        ServerError::InvalidRequest(format!("bad _limit: {}", value))
                    })?)
                }
                "not_deleted" => items.retain(|a| !a.deleted),
                "unread" => {
                    let unread = value == "true";
                    items.retain(|a| {
                        !a.deleted
                            && a.fields.get(fields::UNREAD).and_then(Value::as_bool) == Some(unread)
                    });
                }
                other => {
                    let (attr, wanted): (&str, fn(Ordering) -> bool) =
                        if let Some(attr) = other.strip_prefix("min_") {
                            (attr, Ordering::is_ge)
                        } else if let Some(attr) = other.strip_prefix("max_") {
                            (attr, Ordering::is_le)
                        } else if let Some(attr) = other.strip_prefix("not_") {
                            (attr, Ordering::is_ne)
                        } else {
                            return Err(ServerError::InvalidRequest(format!(
                                "unknown filter: {}",
                                other
                            )));
                        };
                    items.retain(|a| {
                        a.fields
                            .get(attr)
                            .and_then(|v| compare(v, value))
                            .is_some_and(wanted)
                    });
                }
            }
        }

        items.sort_by(|a, b| a.last_modified.cmp(&b.last_modified).then(a.id.cmp(&b.id)));
        let total = items.len();
        let items: Vec<ServerReadingListRecord> = items
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(Article::to_record)
            .collect();
        debug!(returned = items.len(), total, ?since, "articles listed");
        Ok(Listing::Items {
            items,
            last_modified: state.last_modified,
            total,
        })
    }
}
