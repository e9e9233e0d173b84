//! Batched uploads through the server batch API.
//!
//! Records are packed into POSTs within the server's `info/configuration`
//! limits, and POSTs into server batches. A batch is opened with
//! `batch=true`, extended with `batch=<token>` and closed with `commit=true`.
//! Nothing in a batch is visible on the server, or reported as stored, until
//! the commit succeeds.

use crate::error::{SyncError, SyncResult};
use crate::server11::{json_array_body, report_post_response, Outgoing};
use crate::session::{SessionContext, StoreEvent};
use crate::transport::Transport;
use rlsync_protocol::headers::X_IF_UNMODIFIED_SINCE;
use rlsync_protocol::timestamp::millis_to_decimal_seconds;
use rlsync_protocol::{
    BatchParam, CollectionQuery, HttpRequest, InfoConfiguration, Method, PostResponse, Record,
};
use tracing::{debug, info, warn};
use url::Url;

type Post = Vec<Outgoing>;
type Batch = Vec<Post>;

/// Uploads records in server batches.
pub struct BatchingUploader {
    transport: Transport,
    collection: String,
    collection_url: Url,
    limits: InfoConfiguration,
}

impl BatchingUploader {
    /// Creates an uploader.
    pub fn new(
        transport: Transport,
        collection: impl Into<String>,
        collection_url: Url,
        limits: InfoConfiguration,
    ) -> Self {
        Self {
            transport,
            collection: collection.into(),
            collection_url,
            limits,
        }
    }

    fn payload_size(record: &Record, out: &Outgoing) -> u64 {
        record
            .to_wire()
            .map(|wire| wire.payload.len() as u64)
            .unwrap_or(out.len() as u64)
    }

    /// Serializes records, failing any that exceed the per-record limits.
    fn prepare(&self, ctx: &SessionContext, records: &[Record]) -> Vec<Outgoing> {
        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            let out = match Outgoing::from_record(record) {
                Ok(out) => out,
                Err(event) => {
                    ctx.report_store(event);
                    continue;
                }
            };
            let payload = Self::payload_size(record, &out);
            let envelope = out.len() as u64 + 2;
            let limit = if payload > self.limits.max_record_payload_bytes {
                Some(self.limits.max_record_payload_bytes)
            } else if envelope > self.limits.max_post_bytes {
                Some(self.limits.max_post_bytes)
            } else {
                None
            };
            if let Some(limit) = limit {
                warn!(collection = %self.collection, guid = %out.guid, size = payload, limit, "record too large");
                ctx.report_store(StoreEvent::Failed {
                    guid: Some(out.guid.clone()),
                    error: SyncError::RecordTooLarge {
                        guid: out.guid,
                        size: payload.max(envelope),
                        limit,
                    },
                });
                continue;
            }
            prepared.push(out);
        }
        prepared
    }

    /// Packs records into batches of POSTs within the server limits.
    fn plan(&self, records: Vec<Outgoing>) -> Vec<Batch> {
        let limits = &self.limits;
        let mut batches: Vec<Batch> = Vec::new();
        let mut batch: Batch = Vec::new();
        let mut batch_records = 0u64;
        let mut batch_bytes = 0u64;
        let mut post: Post = Vec::new();
        let mut post_bytes = 2u64;

        for record in records {
            let size = record.len() as u64 + 1;

            let batch_full = batch_records + 1 > limits.max_total_records
                || batch_bytes + size > limits.max_total_bytes;
            if batch_full && (batch_records > 0) {
                if !post.is_empty() {
                    batch.push(std::mem::take(&mut post));
                }
                batches.push(std::mem::take(&mut batch));
                batch_records = 0;
                batch_bytes = 0;
                post_bytes = 2;
            }

            let post_full = post.len() as u64 + 1 > limits.max_post_records
                || post_bytes + size > limits.max_post_bytes.min(limits.max_request_bytes);
            if post_full && !post.is_empty() {
                batch.push(std::mem::take(&mut post));
                post_bytes = 2;
            }

            post_bytes += size;
            batch_records += 1;
            batch_bytes += size;
            post.push(record);
        }
        if !post.is_empty() {
            batch.push(post);
        }
        if !batch.is_empty() {
            batches.push(batch);
        }
        batches
    }

    fn fail_all<'a>(
        ctx: &SessionContext,
        records: impl IntoIterator<Item = &'a Outgoing>,
        error: &SyncError,
    ) {
        for record in records {
            ctx.report_store(StoreEvent::Failed {
                guid: Some(record.guid.clone()),
                error: error.clone(),
            });
        }
    }

    /// Uploads `records`. Returns the last committed collection timestamp.
    ///
    /// `unmodified_since` is the collection timestamp the upload is based
    /// on; the server refuses the upload with 412 if the collection moved.
    pub fn upload(
        &self,
        ctx: &SessionContext,
        records: &[Record],
        mut unmodified_since: Option<i64>,
    ) -> SyncResult<Option<i64>> {
        let prepared = self.prepare(ctx, records);
        let batches = self.plan(prepared);
        let mut end: Option<i64> = None;

        for (batch_index, batch) in batches.iter().enumerate() {
            let mut token: Option<String> = None;
            let mut uncommitted: Vec<Outgoing> = Vec::new();

            for (post_index, post) in batch.iter().enumerate() {
                let last = post_index + 1 == batch.len();
                let mut query = CollectionQuery::new().batch(match &token {
                    Some(token) => BatchParam::Token(token.clone()),
                    None => BatchParam::Start,
                });
                if last {
                    query = query.commit();
                }
                let url = query.to_url(&self.collection_url);
                let mut request =
                    HttpRequest::with_json_body(Method::Post, url.as_str(), json_array_body(post));
                if let Some(since) = unmodified_since {
                    request = request.with_header(X_IF_UNMODIFIED_SINCE, millis_to_decimal_seconds(since));
                }

                let mut response = self.transport.send(request)?;
                ctx.observe_response(&response);
                let status = response.status();

                if status == 401 || status == 403 {
                    return Err(SyncError::AuthenticationInvalid(status));
                }
                if status == 412 {
                    warn!(collection = %self.collection, batch = batch_index, "collection changed during upload");
                    let error = SyncError::ConcurrentModification;
                    Self::fail_all(ctx, &uncommitted, &error);
                    Self::fail_all(ctx, batch[post_index..].iter().flatten(), &error);
                    Self::fail_all(ctx, batches[batch_index + 1..].iter().flatten().flatten(), &error);
                    return Err(error);
                }
                if !response.is_success() {
                    let error = SyncError::from_status(status, response.text().unwrap_or_default());
                    warn!(collection = %self.collection, status, batch = batch_index, "batch upload failed");
                    Self::fail_all(ctx, &uncommitted, &error);
                    Self::fail_all(ctx, batch[post_index..].iter().flatten(), &error);
                    break;
                }

                let body = PostResponse::from_json(&response.text()?)?;
                let (accepted, rejected): (Vec<Outgoing>, Vec<Outgoing>) = post
                    .iter()
                    .cloned()
                    .partition(|r| body.success.iter().any(|id| id == &r.guid));
                report_post_response(ctx, &rejected, &body);
                uncommitted.extend(accepted);

                let committed = last || body.batch.is_none();
                if committed {
                    for record in uncommitted.drain(..) {
                        ctx.report_store(StoreEvent::Succeeded(record.guid));
                    }
                    if let Some(modified) = body.modified_millis() {
                        end = end.max(Some(modified));
                        unmodified_since = Some(modified);
                    }
                    token = None;
                    debug!(collection = %self.collection, batch = batch_index, post = post_index, "committed");
                } else {
                    token = body.batch.clone();
                }
            }
        }

        info!(collection = %self.collection, records = records.len(), batches = batches.len(), "upload finished");
        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::*;
    use crate::session::{FetchRecordsDelegate, RepositorySession, SyncProtocol};
    use crate::transport::{MockHttpClient, MockResponse};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Uploads everything stored through a `BatchingUploader`.
    struct UploadOnly {
        uploader: BatchingUploader,
        records: Mutex<Vec<Record>>,
        unmodified_since: Option<i64>,
    }

    impl SyncProtocol for UploadOnly {
        fn fetch_since(
            &self,
            _ctx: &SessionContext,
            _since: i64,
            _delegate: &Arc<dyn FetchRecordsDelegate>,
        ) -> SyncResult<i64> {
            Ok(0)
        }
        fn fetch(
            &self,
            _ctx: &SessionContext,
            _guids: &[String],
            _delegate: &Arc<dyn FetchRecordsDelegate>,
        ) -> SyncResult<i64> {
            Ok(0)
        }
        fn store(&self, _ctx: &SessionContext, record: Record) -> SyncResult<()> {
            self.records.lock().push(record);
            Ok(())
        }
        fn store_done(&self, ctx: &SessionContext) -> SyncResult<Option<i64>> {
            let records = std::mem::take(&mut *self.records.lock());
            self.uploader.upload(ctx, &records, self.unmodified_since)
        }
    }

    fn limits() -> InfoConfiguration {
        InfoConfiguration {
            max_post_records: 2,
            ..InfoConfiguration::default()
        }
    }

    fn session(
        client: Arc<MockHttpClient>,
        limits: InfoConfiguration,
        unmodified_since: Option<i64>,
    ) -> RepositorySession<UploadOnly> {
        let uploader = BatchingUploader::new(
            Transport::new(client),
            "tabs",
            Url::parse("https://sync.example.com/1.5/1/storage/tabs").unwrap(),
            limits,
        );
        let protocol = UploadOnly {
            uploader,
            records: Mutex::new(Vec::new()),
            unmodified_since,
        };
        let session = RepositorySession::new("upload-test", protocol).unwrap();
        session.begin().unwrap();
        session
    }

    fn store(session: &RepositorySession<UploadOnly>, guids: &[&str]) {
        for guid in guids {
            session
                .store(Record::new("tabs").with_guid(*guid).with_field("n", 1))
                .unwrap();
        }
    }

    #[test]
    fn batch_open_extend_commit() {
        let client = Arc::new(MockHttpClient::new());
        client.push_response(
            MockResponse::new(202).with_body(r#"{"batch": "tok", "success": ["a", "b"], "failed": {}}"#),
        );
        client.push_response(
            MockResponse::new(202).with_body(r#"{"batch": "tok", "success": ["c"], "failed": {"d": "invalid"}}"#),
        );
        client.push_response(
            MockResponse::new(200)
                .with_body(r#"{"modified": 42.5, "success": ["e"], "failed": {}}"#),
        );
        let session = session(client.clone(), limits(), Some(10_000));
        store(&session, &["a", "b", "c", "d", "e"]);

        let (delegate, rx) = RecordingStoreDelegate::new();
        session.store_done(delegate);
        let events = drain_store(&rx);

        let urls: Vec<String> = client.requests().iter().map(|r| r.url.clone()).collect();
        assert!(urls[0].ends_with("?batch=true"));
        assert!(urls[1].ends_with("?batch=tok"));
        assert!(urls[2].ends_with("?batch=tok&commit=true"));
        for request in client.requests() {
            assert_eq!(request.header(X_IF_UNMODIFIED_SINCE), Some("10.00"));
        }

        // The rejection is reported immediately; successes only after commit.
        assert!(matches!(&events[0], StoreOutcome::Failed(Some(g), _) if g == "d"));
        let succeeded: Vec<&StoreOutcome> = events
            .iter()
            .filter(|e| matches!(e, StoreOutcome::Succeeded(_)))
            .collect();
        assert_eq!(succeeded.len(), 4);
        assert_eq!(events.last(), Some(&StoreOutcome::Completed(42_500)));
    }

    #[test]
    fn server_without_batching_commits_each_post() {
        let client = Arc::new(MockHttpClient::new());
        client.push_response(
            MockResponse::new(200).with_body(r#"{"modified": 1.0, "success": ["a", "b"], "failed": {}}"#),
        );
        client.push_response(
            MockResponse::new(200).with_body(r#"{"modified": 2.0, "success": ["c"], "failed": {}}"#),
        );
        let session = session(client.clone(), limits(), None);
        store(&session, &["a", "b", "c"]);

        let (delegate, rx) = RecordingStoreDelegate::new();
        session.store_done(delegate);
        let events = drain_store(&rx);

        assert_eq!(events[0], StoreOutcome::Succeeded("a".into()));
        assert_eq!(events[1], StoreOutcome::Succeeded("b".into()));
        assert_eq!(events[2], StoreOutcome::Succeeded("c".into()));
        assert_eq!(events[3], StoreOutcome::Completed(2_000));
        // Each POST opened its own batch, and the second carried the new timestamp.
        assert!(client.requests()[1].url.ends_with("?batch=true&commit=true"));
        assert_eq!(client.requests()[1].header(X_IF_UNMODIFIED_SINCE), Some("1.00"));
    }

    #[test]
    fn precondition_failure_fails_remaining() {
        let client = Arc::new(MockHttpClient::new());
        client.push_response(
            MockResponse::new(202).with_body(r#"{"batch": "tok", "success": ["a", "b"], "failed": {}}"#),
        );
        client.push_response(MockResponse::new(412));
        let session = session(client, limits(), Some(5_000));
        store(&session, &["a", "b", "c"]);

        let (delegate, rx) = RecordingStoreDelegate::new();
        session.store_done(delegate);
        let events = drain_store(&rx);

        let failed = events
            .iter()
            .filter(|e| matches!(e, StoreOutcome::Failed(_, SyncError::ConcurrentModification)))
            .count();
        assert_eq!(failed, 3);
        assert!(!events.iter().any(|e| matches!(e, StoreOutcome::Succeeded(_))));
        assert_eq!(
            events.last(),
            Some(&StoreOutcome::StoreFailed(SyncError::ConcurrentModification))
        );
    }

    #[test]
    fn oversized_payload_fails_individually() {
        let client = Arc::new(MockHttpClient::new());
        client.push_response(
            MockResponse::new(200).with_body(r#"{"modified": 3.0, "success": ["ok"], "failed": {}}"#),
        );
        let limits = InfoConfiguration {
            max_record_payload_bytes: 64,
            ..InfoConfiguration::default()
        };
        let session = session(client.clone(), limits, None);
        session
            .store(Record::new("tabs").with_guid("huge").with_field("x", "y".repeat(200)))
            .unwrap();
        store(&session, &["ok"]);

        let (delegate, rx) = RecordingStoreDelegate::new();
        session.store_done(delegate);
        let events = drain_store(&rx);

        assert!(matches!(
            &events[0],
            StoreOutcome::Failed(Some(g), SyncError::RecordTooLarge { limit: 64, .. }) if g == "huge"
        ));
        assert_eq!(events[1], StoreOutcome::Succeeded("ok".into()));
        assert_eq!(client.requests().len(), 1);
    }

    #[test]
    fn total_limits_split_batches() {
        let client = Arc::new(MockHttpClient::new());
        for modified in ["1.0", "2.0"] {
            client.push_response(MockResponse::new(200).with_body(format!(
                r#"{{"modified": {}, "success": ["a", "b", "c"], "failed": {{}}}}"#,
                modified
            )));
        }
        let limits = InfoConfiguration {
            max_total_records: 2,
            ..InfoConfiguration::default()
        };
        let session = session(client.clone(), limits, None);
        store(&session, &["a", "b", "c"]);

        let (delegate, rx) = RecordingStoreDelegate::new();
        session.store_done(delegate);
        drain_store(&rx);

        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].url.ends_with("?batch=true&commit=true"));
        assert!(requests[1].url.ends_with("?batch=true&commit=true"));
    }
}
