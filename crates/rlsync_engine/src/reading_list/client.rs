//! HTTP client for the Reading List `articles` collection.

use crate::error::{SyncError, SyncResult};
use crate::transport::Transport;
use rlsync_protocol::headers::{IF_MODIFIED_SINCE, IF_UNMODIFIED_SINCE};
use rlsync_protocol::{
    ClientReadingListRecord, HttpRequest, HttpResponse, Method, ReadingListQuery,
    ServerReadingListRecord,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

/// The outcome of a single-article request.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// 200 or 201. Carries the server's copy when the response had one.
    Success(Option<ServerReadingListRecord>),
    /// 404.
    NotFound,
    /// 409.
    Conflict,
    /// 412.
    PreconditionFailed,
    /// Any other non-success status.
    Failed(SyncError),
}

/// The outcome of an incremental download.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    /// 304: nothing changed since the checkpoint.
    NotModified,
    /// The changed records.
    Records {
        /// Records in server order.
        records: Vec<ServerReadingListRecord>,
        /// The collection's `Last-Modified`.
        last_modified: Option<i64>,
        /// `Total-Records`, if sent.
        total_records: Option<i64>,
    },
    /// Any other non-success status.
    Failed(SyncError),
}

#[derive(Deserialize)]
struct ItemsBody {
    #[serde(default)]
    items: Vec<Value>,
}

/// Talks to `<endpoint>/articles`.
///
/// Transport failures and 401/403 are returned as errors; every other status
/// is an outcome for the caller to interpret.
#[derive(Debug, Clone)]
pub struct ReadingListClient {
    transport: Transport,
    articles_url: Url,
}

impl ReadingListClient {
    /// Creates a client for the service rooted at `endpoint`.
    pub fn new(transport: Transport, endpoint: &Url) -> SyncResult<Self> {
        let joined = format!("{}/articles", endpoint.as_str().trim_end_matches('/'));
        let articles_url = Url::parse(&joined)
            .map_err(|e| SyncError::IllegalConfiguration(format!("{}: {}", joined, e)))?;
        Ok(Self {
            transport,
            articles_url,
        })
    }

    /// Returns the collection URL.
    pub fn articles_url(&self) -> &Url {
        &self.articles_url
    }

    fn article_url(&self, guid: &str) -> String {
        format!("{}/{}", self.articles_url, guid)
    }

    fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let response = self.transport.send(request)?;
        match response.status() {
            401 | 403 => Err(SyncError::AuthenticationInvalid(response.status())),
            _ => Ok(response),
        }
    }

    fn item_outcome(mut response: HttpResponse) -> SyncResult<ItemOutcome> {
        Ok(match response.status() {
            200 | 201 => {
                let text = response.text()?;
                if text.trim().is_empty() {
                    ItemOutcome::Success(None)
                } else {
                    let value: Value = serde_json::from_str(&text)?;
                    ItemOutcome::Success(Some(ServerReadingListRecord::from_json(value)?))
                }
            }
            404 => ItemOutcome::NotFound,
            409 => ItemOutcome::Conflict,
            412 => ItemOutcome::PreconditionFailed,
            status => ItemOutcome::Failed(SyncError::from_status(
                status,
                response.text().unwrap_or_default(),
            )),
        })
    }

    /// Creates an article. The server answers 201 (or 200 if it already
    /// had an identical one) and 409 if another article has the same
    /// resolved URL.
    pub fn add(&self, record: &ClientReadingListRecord) -> SyncResult<ItemOutcome> {
        let body = serde_json::to_vec(&record.to_upload_json())?;
        let request =
            HttpRequest::with_json_body(Method::Post, self.articles_url.as_str(), body);
        debug!(url = ?record.url(), "uploading new article");
        Self::item_outcome(self.send(request)?)
    }

    /// Patches an article.
    ///
    /// With `unmodified_since`, the server refuses with 412 if the article
    /// changed after that time.
    pub fn patch(
        &self,
        guid: &str,
        body: &Value,
        unmodified_since: Option<i64>,
    ) -> SyncResult<ItemOutcome> {
        let mut request = HttpRequest::with_json_body(
            Method::Patch,
            self.article_url(guid),
            serde_json::to_vec(body)?,
        );
        if let Some(since) = unmodified_since {
            request = request.with_header(IF_UNMODIFIED_SINCE, since.to_string());
        }
        trace!(%guid, "patching article");
        Self::item_outcome(self.send(request)?)
    }

    /// Deletes an article.
    pub fn delete(&self, guid: &str) -> SyncResult<ItemOutcome> {
        trace!(%guid, "deleting article");
        Self::item_outcome(self.send(HttpRequest::delete(self.article_url(guid)))?)
    }

    /// Fetches every article changed after `since` (all of them for `None`),
    /// tombstones included.
    pub fn get_since(&self, since: Option<i64>) -> SyncResult<DownloadOutcome> {
        let mut query = ReadingListQuery::new();
        let mut request_since = None;
        if let Some(since) = since.filter(|since| *since > 0) {
            query = query.since(since);
            request_since = Some(since);
        }
        let url = query.to_url(&self.articles_url);
        let mut request = HttpRequest::get(url.as_str());
        if let Some(since) = request_since {
            request = request.with_header(IF_MODIFIED_SINCE, since.to_string());
        }

        let mut response = self.send(request)?;
        match response.status() {
            304 => Ok(DownloadOutcome::NotModified),
            200 => {
                let last_modified = response.reading_list_last_modified();
                let total_records = response.total_records();
                let body: ItemsBody = response.json()?;
                let records = body
                    .items
                    .into_iter()
                    .map(ServerReadingListRecord::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                debug!(records = records.len(), ?last_modified, "downloaded articles");
                Ok(DownloadOutcome::Records {
                    records,
                    last_modified,
                    total_records,
                })
            }
            status => Ok(DownloadOutcome::Failed(SyncError::from_status(
                status,
                response.text().unwrap_or_default(),
            ))),
        }
    }
}
