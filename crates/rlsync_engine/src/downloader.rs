//! Paged, resumable collection downloads.
//!
//! Each page is fully delivered and acknowledged by the delegate before the
//! resume point is saved, so an interrupted fetch restarts from the first
//! page that was not yet applied locally.

use crate::config::Server15Config;
use crate::error::{SyncError, SyncResult};
use crate::server11::stream_records;
use crate::session::{FetchRecordsDelegate, SessionContext};
use crate::state_provider::{
    RepositoryStateProvider, StagedWrites, HIGH_WATER_MARK, OFFSET, OFFSET_ORDER, OFFSET_SINCE,
};
use crate::transport::Transport;
use rlsync_protocol::headers::{NEWLINES_MEDIA_TYPE, X_IF_UNMODIFIED_SINCE};
use rlsync_protocol::timestamp::millis_to_decimal_seconds;
use rlsync_protocol::{CollectionQuery, HttpRequest};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Downloads a collection in pages, persisting the resume point per page.
pub struct BatchingDownloader {
    transport: Transport,
    collection: String,
    collection_url: Url,
    config: Server15Config,
    state: Arc<dyn RepositoryStateProvider>,
    collection_modified: Mutex<Option<i64>>,
}

impl BatchingDownloader {
    /// Creates a downloader.
    pub fn new(
        transport: Transport,
        collection: impl Into<String>,
        collection_url: Url,
        config: Server15Config,
        state: Arc<dyn RepositoryStateProvider>,
    ) -> Self {
        Self {
            transport,
            collection: collection.into(),
            collection_url,
            config,
            state,
            collection_modified: Mutex::new(None),
        }
    }

    /// Returns the collection's `X-Last-Modified` as seen by the last fetch.
    pub fn collection_modified(&self) -> Option<i64> {
        *self.collection_modified.lock()
    }

    /// Returns the stored offset if it belongs to a fetch of `since`.
    fn resume_offset(&self, since: i64) -> Option<String> {
        if !self.config.allow_multiple_batches {
            return None;
        }
        let order = self.config.sort_order.as_str();
        let stored_since = self.state.get_long(OFFSET_SINCE)?;
        let stored_order = self.state.get_string(OFFSET_ORDER)?;
        if stored_since == since && stored_order == order {
            self.state.get_string(OFFSET)
        } else {
            None
        }
    }

    fn query(&self, since: i64, offset: Option<&str>) -> CollectionQuery {
        let mut query = CollectionQuery::new()
            .full()
            .newer(since)
            .sort(self.config.sort_order);
        if let Some(limit) = self.config.batch_size {
            query = query.limit(limit);
        }
        if let Some(offset) = offset {
            query = query.offset(offset);
        }
        query
    }

    /// Fetches everything changed after `since`, returning the fetch end.
    pub fn fetch_since(
        &self,
        ctx: &SessionContext,
        since: i64,
        delegate: &Arc<dyn FetchRecordsDelegate>,
    ) -> SyncResult<i64> {
        let mut offset = self.resume_offset(since);
        if let Some(offset) = &offset {
            info!(collection = %self.collection, %offset, since, "resuming paged fetch");
        }
        let mut unmodified_since: Option<i64> = None;
        let mut pages = 0usize;

        loop {
            let url = self.query(since, offset.as_deref()).to_url(&self.collection_url);
            let mut request =
                HttpRequest::get(url.as_str()).with_header("accept", NEWLINES_MEDIA_TYPE);
            if let Some(modified) = unmodified_since {
                request =
                    request.with_header(X_IF_UNMODIFIED_SINCE, millis_to_decimal_seconds(modified));
            }

            let pending = ctx.register_request();
            let mut response = self.transport.send(request)?;
            ctx.observe_response(&response);

            if response.status() == 412 {
                warn!(collection = %self.collection, pages, "collection changed between pages");
                self.state.reset_and_commit()?;
                return Err(SyncError::ConcurrentModification);
            }
            if !response.is_success() {
                let body = response.text().unwrap_or_default();
                return Err(SyncError::from_status(response.status(), body));
            }

            let last_modified = response.last_modified();
            if unmodified_since.is_none() {
                unmodified_since = last_modified;
                *self.collection_modified.lock() = last_modified;
            }
            let next_offset = response.next_offset().map(str::to_string);
            let end = response
                .weave_timestamp()
                .or(last_modified)
                .unwrap_or(since);

            let summary = stream_records(ctx, &self.collection, response, &pending, delegate)?;
            pages += 1;
            debug!(collection = %self.collection, page = pages, records = summary.count, "page delivered");

            let batch_delegate = Arc::clone(delegate);
            ctx.deliver_and_wait(move || batch_delegate.on_batch_completed())?;
            if pending.is_aborted() {
                return Err(SyncError::Cancelled);
            }

            let Some(next) = next_offset else {
                self.state.reset_and_commit()?;
                info!(collection = %self.collection, pages, end, "paged fetch complete");
                return Ok(end);
            };

            if !self.config.allow_multiple_batches {
                self.state.reset_and_commit()?;
                return Err(SyncError::MultipleBatchesDisallowed);
            }

            let mut writes = StagedWrites::new()
                .put_string(OFFSET, next.clone())
                .put_long(OFFSET_SINCE, since)
                .put_string(OFFSET_ORDER, self.config.sort_order.as_str());
            if self.config.uses_high_water_mark() {
                if let Some(high_water_mark) = summary.last_modified {
                    writes = writes.put_long(HIGH_WATER_MARK, high_water_mark);
                }
            }
            self.state.commit(writes)?;
            offset = Some(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::*;
    use crate::session::{RepositorySession, StoreEvent, SyncProtocol};
    use crate::state_provider::NonPersistentRepositoryStateProvider;
    use crate::transport::{MockHttpClient, MockResponse};
    use rlsync_protocol::{Record, SortOrder};

    /// Exposes the downloader directly as a session protocol.
    struct DownloadOnly(BatchingDownloader);

    impl SyncProtocol for DownloadOnly {
        fn fetch_since(
            &self,
            ctx: &SessionContext,
            since: i64,
            delegate: &Arc<dyn FetchRecordsDelegate>,
        ) -> SyncResult<i64> {
            self.0.fetch_since(ctx, since, delegate)
        }
        fn fetch(
            &self,
            _ctx: &SessionContext,
            _guids: &[String],
            _delegate: &Arc<dyn FetchRecordsDelegate>,
        ) -> SyncResult<i64> {
            Ok(0)
        }
        fn store(&self, ctx: &SessionContext, record: Record) -> SyncResult<()> {
            ctx.report_store(StoreEvent::Succeeded(record.guid.unwrap_or_default()));
            Ok(())
        }
        fn store_done(&self, _ctx: &SessionContext) -> SyncResult<Option<i64>> {
            Ok(None)
        }
    }

    fn line(id: &str, modified: &str) -> String {
        format!(r#"{{"id":"{}","modified":{},"payload":"{{}}"}}"#, id, modified)
    }

    fn page(lines: &[String], next: Option<&str>) -> MockResponse {
        let mut response = MockResponse::new(200)
            .with_header("X-Last-Modified", "500.00")
            .with_header("X-Weave-Timestamp", "600.00")
            .with_body(lines.join("\n"));
        if let Some(next) = next {
            response = response.with_header("X-Weave-Next-Offset", next);
        }
        response
    }

    fn session(
        client: Arc<MockHttpClient>,
        config: Server15Config,
        state: Arc<NonPersistentRepositoryStateProvider>,
    ) -> RepositorySession<DownloadOnly> {
        let downloader = BatchingDownloader::new(
            Transport::new(client),
            "bookmarks",
            Url::parse("https://sync.example.com/1.5/1/storage/bookmarks").unwrap(),
            config,
            state,
        );
        let session = RepositorySession::new("download-test", DownloadOnly(downloader)).unwrap();
        session.begin().unwrap();
        session
    }

    #[test]
    fn follows_offsets_and_saves_resume_point() {
        let client = Arc::new(MockHttpClient::new());
        client.push_response(page(&[line("a", "100"), line("b", "200")], Some("off1")));
        client.push_response(page(&[line("c", "300")], None));
        let state = Arc::new(NonPersistentRepositoryStateProvider::new());
        let config = Server15Config::new(2).with_high_water_mark(true);
        let session = session(client.clone(), config, state.clone());

        let (delegate, rx) = RecordingFetchDelegate::new();
        session.fetch_since(0, delegate);
        let events = drain_fetch(&rx);

        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                FetchEvent::Record(_) => "record",
                FetchEvent::Batch => "batch",
                FetchEvent::Failed(_) => "failed",
                FetchEvent::Completed(_) => "completed",
            })
            .collect();
        assert_eq!(
            kinds,
            ["record", "record", "batch", "record", "batch", "completed"]
        );
        assert_eq!(events.last(), Some(&FetchEvent::Completed(600_000)));

        let requests = client.requests();
        assert_eq!(
            requests[0].url,
            "https://sync.example.com/1.5/1/storage/bookmarks?full=1&newer=0.00&limit=2&sort=oldest"
        );
        assert!(requests[0].header(X_IF_UNMODIFIED_SINCE).is_none());
        assert!(requests[1].url.ends_with("&offset=off1"));
        assert_eq!(requests[1].header(X_IF_UNMODIFIED_SINCE), Some("500.00"));

        // The final page clears the resume point.
        assert!(state.get_string(OFFSET).is_none());
        assert!(state.get_long(HIGH_WATER_MARK).is_none());
    }

    #[test]
    fn interrupted_fetch_keeps_resume_point() {
        let client = Arc::new(MockHttpClient::new());
        client.push_response(page(&[line("a", "100"), line("b", "200")], Some("off1")));
        client.push_error(SyncError::transport_retryable("connection reset"));
        let state = Arc::new(NonPersistentRepositoryStateProvider::new());
        let config = Server15Config::new(2).with_high_water_mark(true);
        let session = session(client, config, state.clone());

        let (delegate, rx) = RecordingFetchDelegate::new();
        session.fetch_since(50, delegate);
        assert!(matches!(
            drain_fetch(&rx).last(),
            Some(FetchEvent::Failed(SyncError::Transport { .. }))
        ));

        assert_eq!(state.get_string(OFFSET).as_deref(), Some("off1"));
        assert_eq!(state.get_long(OFFSET_SINCE), Some(50));
        assert_eq!(state.get_string(OFFSET_ORDER).as_deref(), Some("oldest"));
        assert_eq!(state.get_long(HIGH_WATER_MARK), Some(200_000));
    }

    #[test]
    fn resumes_only_matching_fetch() {
        let state = Arc::new(NonPersistentRepositoryStateProvider::new());
        state
            .commit(
                StagedWrites::new()
                    .put_string(OFFSET, "stored")
                    .put_long(OFFSET_SINCE, 50)
                    .put_string(OFFSET_ORDER, "oldest"),
            )
            .unwrap();

        let client = Arc::new(MockHttpClient::new());
        client.push_response(page(&[line("c", "300")], None));
        client.push_response(page(&[], None));
        let session = session(client.clone(), Server15Config::new(2), state.clone());

        let (delegate, rx) = RecordingFetchDelegate::new();
        session.fetch_since(50, delegate);
        drain_fetch(&rx);
        assert!(client.requests()[0].url.ends_with("&offset=stored"));

        let (delegate, rx) = RecordingFetchDelegate::new();
        session.fetch_since(60, delegate);
        drain_fetch(&rx);
        assert!(!client.requests()[1].url.contains("offset="));
    }

    #[test]
    fn sort_order_mismatch_ignores_offset() {
        let state = Arc::new(NonPersistentRepositoryStateProvider::new());
        state
            .commit(
                StagedWrites::new()
                    .put_string(OFFSET, "stored")
                    .put_long(OFFSET_SINCE, 0)
                    .put_string(OFFSET_ORDER, "oldest"),
            )
            .unwrap();
        let client = Arc::new(MockHttpClient::new());
        client.push_response(page(&[], None));
        let config = Server15Config::new(2).with_sort_order(SortOrder::Newest);
        let session = session(client.clone(), config, state);

        let (delegate, rx) = RecordingFetchDelegate::new();
        session.fetch_since(0, delegate);
        drain_fetch(&rx);
        assert!(!client.requests()[0].url.contains("offset="));
    }

    #[test]
    fn precondition_failure_resets_state() {
        let client = Arc::new(MockHttpClient::new());
        client.push_response(page(&[line("a", "100")], Some("off1")));
        client.push_response(MockResponse::new(412));
        let state = Arc::new(NonPersistentRepositoryStateProvider::new());
        let session = session(client, Server15Config::new(1), state.clone());

        let (delegate, rx) = RecordingFetchDelegate::new();
        session.fetch_since(0, delegate);
        assert_eq!(
            drain_fetch(&rx).last(),
            Some(&FetchEvent::Failed(SyncError::ConcurrentModification))
        );
        assert!(state.get_string(OFFSET).is_none());
    }

    #[test]
    fn single_batch_mode_rejects_offsets() {
        let client = Arc::new(MockHttpClient::new());
        client.push_response(page(&[line("a", "100")], Some("off1")));
        let state = Arc::new(NonPersistentRepositoryStateProvider::new());
        let config = Server15Config::new(1).with_multiple_batches(false);
        let session = session(client.clone(), config, state);

        let (delegate, rx) = RecordingFetchDelegate::new();
        session.fetch_since(0, delegate);
        assert_eq!(
            drain_fetch(&rx).last(),
            Some(&FetchEvent::Failed(SyncError::MultipleBatchesDisallowed))
        );
        assert_eq!(client.requests().len(), 1);
    }
}
