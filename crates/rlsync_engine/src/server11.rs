//! The simple (Sync 1.1) server repository.
//!
//! One GET per fetch, records streamed to the delegate as lines arrive, and
//! uploads deferred until `store_done`.

use crate::config::UploadLimits;
use crate::error::{SyncError, SyncResult};
use crate::http::PendingRequest;
use crate::session::{FetchRecordsDelegate, SessionContext, StoreEvent, SyncProtocol};
use crate::transport::Transport;
use parking_lot::Mutex;
use rlsync_protocol::headers::{JSON_MEDIA_TYPE, NEWLINES_MEDIA_TYPE};
use rlsync_protocol::{
    CollectionQuery, HttpRequest, HttpResponse, InfoCollections, Method, PostResponse, Record,
    WireRecord,
};
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Builds `<storage_url>/<collection>`.
pub fn collection_url(storage_url: &Url, collection: &str) -> SyncResult<Url> {
    let joined = format!("{}/{}", storage_url.as_str().trim_end_matches('/'), collection);
    Url::parse(&joined).map_err(|e| SyncError::IllegalConfiguration(format!("{}: {}", joined, e)))
}

/// What a streamed response contained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StreamSummary {
    pub count: usize,
    pub last_modified: Option<i64>,
}

/// Parses a collection response and hands each record to the delegate queue.
///
/// `application/newlines` bodies are read line by line; the abort flag is
/// checked between lines. JSON array bodies are parsed whole.
pub(crate) fn stream_records(
    ctx: &SessionContext,
    collection: &str,
    response: HttpResponse,
    request: &PendingRequest,
    delegate: &Arc<dyn FetchRecordsDelegate>,
) -> SyncResult<StreamSummary> {
    let is_json_array = response
        .header(rlsync_protocol::headers::CONTENT_TYPE)
        .is_some_and(|ct| ct.starts_with(JSON_MEDIA_TYPE));
    let mut summary = StreamSummary::default();
    let mut deliver = |record: Record| {
        summary.count += 1;
        summary.last_modified = Some(record.last_modified);
        let delegate = Arc::clone(delegate);
        ctx.deliver(move || delegate.on_record_fetched(record));
    };

    if is_json_array {
        let mut response = response;
        let wires: Vec<WireRecord> = response.json()?;
        for wire in wires {
            if request.is_aborted() {
                return Err(SyncError::Cancelled);
            }
            deliver(Record::from_wire(collection, wire)?);
        }
        return Ok(summary);
    }

    let reader = BufReader::new(response.into_body());
    for line in reader.lines() {
        if request.is_aborted() {
            debug!(collection, "fetch aborted mid-stream");
            return Err(SyncError::Cancelled);
        }
        let line = line.map_err(|e| SyncError::transport_retryable(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        deliver(Record::from_wire_line(collection, &line)?);
    }
    Ok(summary)
}

/// A serialized record ready for upload.
#[derive(Debug, Clone)]
pub(crate) struct Outgoing {
    pub guid: String,
    pub json: String,
}

impl Outgoing {
    /// Serializes `record`, or reports why it cannot be uploaded.
    pub fn from_record(record: &Record) -> Result<Self, StoreEvent> {
        let guid = record.guid.clone();
        match record.to_wire_json() {
            Ok(json) => Ok(Self {
                guid: guid.unwrap_or_default(),
                json,
            }),
            Err(e) => Err(StoreEvent::Failed {
                guid,
                error: e.into(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.json.len()
    }
}

/// Joins serialized records into a JSON array body.
pub(crate) fn json_array_body(records: &[Outgoing]) -> Vec<u8> {
    let mut body = Vec::with_capacity(records.iter().map(|r| r.len() + 1).sum::<usize>() + 2);
    body.push(b'[');
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            body.push(b',');
        }
        body.extend_from_slice(record.json.as_bytes());
    }
    body.push(b']');
    body
}

/// Reports the per-record outcome of a POST response.
pub(crate) fn report_post_response(ctx: &SessionContext, sent: &[Outgoing], body: &PostResponse) {
    for record in sent {
        if body.success.iter().any(|id| id == &record.guid) {
            ctx.report_store(StoreEvent::Succeeded(record.guid.clone()));
        } else {
            let reason = body
                .failure_reason(&record.guid)
                .unwrap_or_else(|| "not acknowledged".to_string());
            ctx.report_store(StoreEvent::Failed {
                guid: Some(record.guid.clone()),
                error: SyncError::RecordRejected {
                    guid: record.guid.clone(),
                    reason,
                },
            });
        }
    }
}

/// Session protocol for a Sync 1.1 collection.
pub struct Server11Protocol {
    transport: Transport,
    collection: String,
    collection_url: Url,
    limits: UploadLimits,
    info_collections: Option<InfoCollections>,
    outgoing: Mutex<Vec<Record>>,
}

impl Server11Protocol {
    /// Creates a protocol for `<storage_url>/<collection>`.
    pub fn new(transport: Transport, storage_url: &Url, collection: &str) -> SyncResult<Self> {
        Ok(Self {
            transport,
            collection: collection.to_string(),
            collection_url: collection_url(storage_url, collection)?,
            limits: UploadLimits::default(),
            info_collections: None,
            outgoing: Mutex::new(Vec::new()),
        })
    }

    /// Sets the upload chunking limits.
    pub fn with_upload_limits(mut self, limits: UploadLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Supplies the `info/collections` document fetched for this sync.
    pub fn with_info_collections(mut self, info: InfoCollections) -> Self {
        self.info_collections = Some(info);
        self
    }

    /// Returns the collection URL.
    pub fn collection_url(&self) -> &Url {
        &self.collection_url
    }

    fn get(
        &self,
        ctx: &SessionContext,
        query: CollectionQuery,
        fallback_end: i64,
        delegate: &Arc<dyn FetchRecordsDelegate>,
    ) -> SyncResult<i64> {
        let url = query.to_url(&self.collection_url);
        let pending = ctx.register_request();
        let request = HttpRequest::get(url.as_str()).with_header("accept", NEWLINES_MEDIA_TYPE);
        let mut response = self.transport.send(request)?;
        ctx.observe_response(&response);
        if !response.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SyncError::from_status(response.status(), body));
        }

        let end = response
            .weave_timestamp()
            .or_else(|| response.last_modified())
            .unwrap_or(fallback_end);
        let summary = stream_records(ctx, &self.collection, response, &pending, delegate)?;
        info!(collection = %self.collection, records = summary.count, end, "fetched records");
        Ok(end)
    }

    fn chunks(&self, records: Vec<Outgoing>) -> Vec<Vec<Outgoing>> {
        let mut chunks = Vec::new();
        let mut current: Vec<Outgoing> = Vec::new();
        let mut current_bytes = 2;
        for record in records {
            let added = record.len() + 1;
            if !current.is_empty()
                && (current.len() >= self.limits.max_records
                    || current_bytes + added > self.limits.max_bytes)
            {
                chunks.push(std::mem::take(&mut current));
                current_bytes = 2;
            }
            current_bytes += added;
            current.push(record);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

impl SyncProtocol for Server11Protocol {
    fn data_available(&self, ctx: &SessionContext) -> SyncResult<bool> {
        Ok(match &self.info_collections {
            Some(info) => info.updated_since(&self.collection, self.last_sync_timestamp(ctx)),
            None => true,
        })
    }

    fn fetch_since(
        &self,
        ctx: &SessionContext,
        since: i64,
        delegate: &Arc<dyn FetchRecordsDelegate>,
    ) -> SyncResult<i64> {
        self.get(ctx, CollectionQuery::new().full().newer(since), since, delegate)
    }

    fn fetch(
        &self,
        ctx: &SessionContext,
        guids: &[String],
        delegate: &Arc<dyn FetchRecordsDelegate>,
    ) -> SyncResult<i64> {
        let query = CollectionQuery::new().full().ids(guids.iter().cloned());
        self.get(ctx, query, ctx.last_sync(), delegate)
    }

    fn store(&self, _ctx: &SessionContext, record: Record) -> SyncResult<()> {
        self.outgoing.lock().push(record);
        Ok(())
    }

    fn store_done(&self, ctx: &SessionContext) -> SyncResult<Option<i64>> {
        let records = std::mem::take(&mut *self.outgoing.lock());
        let mut serialized = Vec::with_capacity(records.len());
        for record in &records {
            match Outgoing::from_record(record) {
                Ok(out) if out.len() + 2 > self.limits.max_bytes => {
                    ctx.report_store(StoreEvent::Failed {
                        guid: Some(out.guid.clone()),
                        error: SyncError::RecordTooLarge {
                            size: out.len() as u64,
                            limit: self.limits.max_bytes as u64,
                            guid: out.guid,
                        },
                    });
                }
                Ok(out) => serialized.push(out),
                Err(event) => ctx.report_store(event),
            }
        }

        let mut end = None;
        for chunk in self.chunks(serialized) {
            let request = HttpRequest::with_json_body(
                Method::Post,
                self.collection_url.as_str(),
                json_array_body(&chunk),
            );
            let mut response = self.transport.send(request)?;
            ctx.observe_response(&response);

            match response.status() {
                401 | 403 => return Err(SyncError::AuthenticationInvalid(response.status())),
                status if !(200..300).contains(&status) => {
                    let error = SyncError::from_status(status, response.text().unwrap_or_default());
                    warn!(collection = %self.collection, status, records = chunk.len(), "upload POST failed");
                    for record in chunk {
                        ctx.report_store(StoreEvent::Failed {
                            guid: Some(record.guid),
                            error: error.clone(),
                        });
                    }
                }
                _ => {
                    let body = PostResponse::from_json(&response.text()?)?;
                    report_post_response(ctx, &chunk, &body);
                    end = end.max(body.modified_millis());
                    debug!(collection = %self.collection, succeeded = body.success.len(), failed = body.failed.len(), "upload POST done");
                }
            }
        }
        Ok(end)
    }

    fn abort(&self, _ctx: &SessionContext) {
        self.outgoing.lock().clear();
    }
}
