//! Request routing for the storage, info and Reading List endpoints.

use crate::auth::{AuthConfig, TokenValidator};
use crate::clock::ServerClock;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::reading_list::{ArticleStore, Listing};
use crate::storage::{CollectionStore, Page};
use rlsync_protocol::headers::{
    self, parse_decimal_seconds, parse_integer, IF_MODIFIED_SINCE, IF_UNMODIFIED_SINCE,
    JSON_MEDIA_TYPE, NEWLINES_MEDIA_TYPE, X_IF_UNMODIFIED_SINCE,
};
use rlsync_protocol::timestamp::millis_to_decimal_seconds;
use rlsync_protocol::{CollectionQuery, HttpRequest, HttpResponse, Method, ReadingListQuery, WireRecord};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Shared state for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Server clock (shared by all stores).
    pub clock: Arc<ServerClock>,
    /// Sync collections.
    pub collections: CollectionStore,
    /// Reading List articles.
    pub articles: ArticleStore,
    validator: Option<TokenValidator>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig) -> Self {
        let clock = Arc::new(ServerClock::new());
        let validator = config
            .auth_secret
            .clone()
            .filter(|_| config.require_auth)
            .map(|secret| TokenValidator::new(AuthConfig::new(secret)));
        Self {
            collections: CollectionStore::new(config.clone(), Arc::clone(&clock)),
            articles: ArticleStore::new(Arc::clone(&clock)),
            clock,
            config,
            validator,
        }
    }

    /// Returns the token validator, if authentication is enabled.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }
}

/// What a request addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    InfoCollections,
    InfoConfiguration,
    Collection(String),
    StoredRecord(String, String),
    Articles,
    Article(String),
}

impl Route {
    fn parse(url: &Url) -> ServerResult<Self> {
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|segment| !segment.is_empty()).collect())
            .unwrap_or_default();
        let not_found = || ServerError::NotFound(url.path().to_string());

        if let Some(pos) = segments.iter().position(|s| *s == "storage") {
            return match &segments[pos + 1..] {
                [collection] => Ok(Route::Collection(collection.to_string())),
                [collection, id] => Ok(Route::StoredRecord(collection.to_string(), id.to_string())),
                _ => Err(not_found()),
            };
        }
        match segments.as_slice() {
            [.., "info", "collections"] => Ok(Route::InfoCollections),
            [.., "info", "configuration"] => Ok(Route::InfoConfiguration),
            [.., "articles"] => Ok(Route::Articles),
            [.., "articles", id] => Ok(Route::Article(id.to_string())),
            _ => Err(not_found()),
        }
    }
}

/// A response under construction.
struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn json(status: u16, value: &Value) -> ServerResult<Self> {
        Ok(Self::new(status)
            .header(headers::CONTENT_TYPE, JSON_MEDIA_TYPE)
            .body(serde_json::to_vec(value)?))
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    fn into_response(self) -> HttpResponse {
        HttpResponse::from_bytes(self.status, self.headers, self.body)
    }
}

#[derive(Deserialize)]
struct PutBody {
    #[serde(default)]
    payload: String,
    #[serde(default)]
    sortindex: Option<i64>,
    #[serde(default)]
    ttl: Option<u64>,
}

fn json_body(request: &HttpRequest) -> ServerResult<Value> {
    let body = request
        .body
        .as_deref()
        .ok_or_else(|| ServerError::InvalidRequest("missing body".into()))?;
    Ok(serde_json::from_slice(body)?)
}

fn decimal_header(request: &HttpRequest, name: &str) -> ServerResult<Option<i64>> {
    match request.header(name) {
        Some(value) => parse_decimal_seconds(value)
            .map(Some)
            .ok_or_else(|| ServerError::InvalidRequest(format!("bad {}: {}", name, value))),
        None => Ok(None),
    }
}

fn integer_header(request: &HttpRequest, name: &str) -> ServerResult<Option<i64>> {
    match request.header(name) {
        Some(value) => parse_integer(value)
            .map(Some)
            .ok_or_else(|| ServerError::InvalidRequest(format!("bad {}: {}", name, value))),
        None => Ok(None),
    }
}

/// Handler for storage and Reading List requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a request. Failures become error responses.
    pub fn handle(&self, request: &HttpRequest) -> HttpResponse {
        debug!(method = %request.method, url = %request.url, "request");
        let sync_route = Url::parse(&request.url)
            .ok()
            .and_then(|url| Route::parse(&url).ok())
            .is_some_and(|route| !matches!(route, Route::Articles | Route::Article(_)));

        let reply = self.dispatch(request).unwrap_or_else(|error| {
            if error.is_server_error() {
                warn!(%error, url = %request.url, "request failed");
            } else {
                debug!(%error, status = error.status(), "request refused");
            }
            Reply::new(error.status())
                .header(headers::CONTENT_TYPE, JSON_MEDIA_TYPE)
                .body(json!({"code": error.status(), "message": error.to_string()}).to_string().into_bytes())
        });

        let reply = if sync_route {
            reply.header(
                headers::X_WEAVE_TIMESTAMP,
                millis_to_decimal_seconds(self.context.clock.now()),
            )
        } else {
            reply
        };
        reply.into_response()
    }

    fn dispatch(&self, request: &HttpRequest) -> ServerResult<Reply> {
        let url = Url::parse(&request.url)
            .map_err(|e| ServerError::InvalidRequest(format!("{}: {}", request.url, e)))?;
        let route = Route::parse(&url)?;

        if let Some(validator) = self.context.validator() {
            let user = validator.authorize(request.header(headers::AUTHORIZATION))?;
            debug!(%user, "authenticated");
        }

        match (route, request.method) {
            (Route::InfoCollections, Method::Get) => self.info_collections(),
            (Route::InfoConfiguration, Method::Get) => {
                Reply::json(200, &serde_json::to_value(self.context.config.limits)?)
            }
            (Route::Collection(collection), Method::Get) => {
                self.get_collection(request, &url, &collection)
            }
            (Route::Collection(collection), Method::Post) => {
                self.post_collection(request, &url, &collection)
            }
            (Route::Collection(collection), Method::Delete) => {
                self.delete_collection(request, &url, &collection)
            }
            (Route::StoredRecord(collection, id), Method::Get) => {
                let record = self.context.collections.get_record(&collection, &id)?;
                Reply::json(200, &serde_json::to_value(record.to_wire())?)
            }
            (Route::StoredRecord(collection, id), Method::Put) => {
                self.put_record(request, &collection, id)
            }
            (Route::StoredRecord(collection, id), Method::Delete) => {
                let since = decimal_header(request, X_IF_UNMODIFIED_SINCE)?;
                let modified = self.context.collections.delete(&collection, &[id], since)?;
                self.modified_reply(modified)
            }
            (Route::Articles, Method::Get) => self.list_articles(request, &url),
            (Route::Articles, Method::Post) => {
                let created = self.context.articles.create(json_body(request)?)?;
                Self::article_reply(created.status(), created.record())
            }
            (Route::Article(id), Method::Get) => {
                Self::article_reply(200, &self.context.articles.get(&id)?)
            }
            (Route::Article(id), Method::Patch) => {
                let since = integer_header(request, IF_UNMODIFIED_SINCE)?;
                let record = self.context.articles.patch(&id, json_body(request)?, since)?;
                Self::article_reply(200, &record)
            }
            (Route::Article(id), Method::Delete) => {
                Self::article_reply(200, &self.context.articles.delete(&id)?)
            }
            (route, method) => Err(ServerError::MethodNotAllowed(format!("{} {:?}", method, route))),
        }
    }

    fn info_collections(&self) -> ServerResult<Reply> {
        let info: serde_json::Map<String, Value> = self
            .context
            .collections
            .info_collections()
            .into_iter()
            .map(|(name, modified)| (name, json!(modified as f64 / 1000.0)))
            .collect();
        Reply::json(200, &Value::Object(info))
    }

    fn get_collection(&self, request: &HttpRequest, url: &Url, collection: &str) -> ServerResult<Reply> {
        let since = decimal_header(request, X_IF_UNMODIFIED_SINCE)?;
        self.context.collections.check_unmodified(collection, since)?;
        let query = CollectionQuery::from_url(url)?;
        let page = self.context.collections.get(collection, &query)?;

        let newlines = request
            .header("accept")
            .is_some_and(|accept| accept.contains(NEWLINES_MEDIA_TYPE));
        let body = Self::page_body(&page, query.is_full(), newlines)?;
        let mut reply = Reply::new(200)
            .header(
                headers::CONTENT_TYPE,
                if newlines { NEWLINES_MEDIA_TYPE } else { JSON_MEDIA_TYPE },
            )
            .header(headers::X_LAST_MODIFIED, millis_to_decimal_seconds(page.last_modified))
            .header(headers::X_WEAVE_RECORDS, page.records.len().to_string())
            .body(body);
        if let Some(next) = &page.next_offset {
            reply = reply.header(headers::X_WEAVE_NEXT_OFFSET, next.clone());
        }
        Ok(reply)
    }

    fn page_body(page: &Page, full: bool, newlines: bool) -> ServerResult<Vec<u8>> {
        let items = page
            .records
            .iter()
            .map(|record| {
                if full {
                    serde_json::to_value(record.to_wire())
                } else {
                    Ok(Value::String(record.id.clone()))
                }
            })
            .collect::<Result<Vec<Value>, _>>()?;

        if !newlines {
            return Ok(serde_json::to_vec(&items)?);
        }
        let mut body = Vec::new();
        for item in &items {
            serde_json::to_writer(&mut body, item)?;
            body.push(b'\n');
        }
        Ok(body)
    }

    fn post_collection(&self, request: &HttpRequest, url: &Url, collection: &str) -> ServerResult<Reply> {
        let body = request.body.as_deref().unwrap_or_default();
        let records: Vec<WireRecord> = serde_json::from_slice(body)?;
        let query = CollectionQuery::from_url(url)?;
        let since = decimal_header(request, X_IF_UNMODIFIED_SINCE)?;

        let outcome = self.context.collections.post(
            collection,
            records,
            body.len() as u64,
            query.batch_value(),
            query.is_commit(),
            since,
        )?;
        let mut reply = Reply::json(outcome.status, &serde_json::to_value(&outcome.response)?)?;
        if let Some(modified) = outcome.response.modified_millis() {
            reply = reply.header(headers::X_LAST_MODIFIED, millis_to_decimal_seconds(modified));
        }
        Ok(reply)
    }

    fn put_record(&self, request: &HttpRequest, collection: &str, id: String) -> ServerResult<Reply> {
        let body: PutBody = serde_json::from_value(json_body(request)?)?;
        let since = decimal_header(request, X_IF_UNMODIFIED_SINCE)?;
        let wire = WireRecord {
            id,
            modified: None,
            payload: body.payload,
            sortindex: body.sortindex,
            ttl: body.ttl,
        };
        let modified = self.context.collections.put(collection, wire, since)?;
        self.modified_reply(modified)
    }

    fn delete_collection(&self, request: &HttpRequest, url: &Url, collection: &str) -> ServerResult<Reply> {
        let query = CollectionQuery::from_url(url)?;
        if query.ids_value().is_empty() && request.header(headers::X_CONFIRM_DELETE).is_none() {
            return Err(ServerError::InvalidRequest(
                "collection delete requires X-Confirm-Delete".into(),
            ));
        }
        let since = decimal_header(request, X_IF_UNMODIFIED_SINCE)?;
        let modified = self.context.collections.delete(collection, query.ids_value(), since)?;
        self.modified_reply(modified)
    }

    fn modified_reply(&self, modified: i64) -> ServerResult<Reply> {
        Ok(Reply::json(200, &json!({"modified": modified as f64 / 1000.0}))?
            .header(headers::X_LAST_MODIFIED, millis_to_decimal_seconds(modified)))
    }

    fn list_articles(&self, request: &HttpRequest, url: &Url) -> ServerResult<Reply> {
        let query = ReadingListQuery::from_url(url);
        let if_modified_since = integer_header(request, IF_MODIFIED_SINCE)?;
        match self.context.articles.list(&query, if_modified_since)? {
            Listing::NotModified => Ok(Reply::new(304)
                .header(headers::LAST_MODIFIED, self.context.articles.last_modified().to_string())),
            Listing::Items {
                items,
                last_modified,
                total,
            } => {
                let items: Vec<Value> = items.iter().map(|r| r.to_json()).collect();
                Ok(Reply::json(200, &json!({ "items": items }))?
                    .header(headers::LAST_MODIFIED, last_modified.to_string())
                    .header(headers::TOTAL_RECORDS, total.to_string()))
            }
        }
    }

    fn article_reply(
        status: u16,
        record: &rlsync_protocol::ServerReadingListRecord,
    ) -> ServerResult<Reply> {
        Ok(Reply::json(status, &record.to_json())?
            .header(headers::LAST_MODIFIED, record.server.last_modified.to_string()))
    }
}
