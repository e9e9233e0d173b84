//! Sync 1.5 collections: paged downloads and batched uploads.

use crate::config::Server15Config;
use crate::downloader::BatchingDownloader;
use crate::error::{SyncError, SyncResult};
use crate::server11::{collection_url, stream_records};
use crate::session::{FetchRecordsDelegate, SessionContext, SyncProtocol};
use crate::state_provider::{RepositoryStateProvider, HIGH_WATER_MARK};
use crate::transport::Transport;
use crate::uploader::BatchingUploader;
use parking_lot::Mutex;
use rlsync_protocol::headers::NEWLINES_MEDIA_TYPE;
use rlsync_protocol::{CollectionQuery, HttpRequest, InfoCollections, InfoConfiguration, Record};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Session protocol for a Sync 1.5 collection.
pub struct Server15Protocol {
    transport: Transport,
    collection: String,
    collection_url: Url,
    config: Server15Config,
    state: Arc<dyn RepositoryStateProvider>,
    downloader: BatchingDownloader,
    info_configuration: InfoConfiguration,
    info_collections: Option<InfoCollections>,
    outgoing: Mutex<Vec<Record>>,
}

impl Server15Protocol {
    /// Creates a protocol for `<storage_url>/<collection>`.
    ///
    /// High-water-mark tracking needs a persistent state provider; asking for
    /// it with a non-persistent one is rejected.
    pub fn new(
        transport: Transport,
        storage_url: &Url,
        collection: &str,
        config: Server15Config,
        state: Arc<dyn RepositoryStateProvider>,
    ) -> SyncResult<Self> {
        if config.allow_high_water_mark && !state.is_persistent() {
            return Err(SyncError::IllegalConfiguration(format!(
                "high-water-mark tracking for {} requires a persistent state provider",
                collection
            )));
        }
        let collection_url = collection_url(storage_url, collection)?;
        let downloader = BatchingDownloader::new(
            transport.clone(),
            collection,
            collection_url.clone(),
            config.clone(),
            Arc::clone(&state),
        );
        Ok(Self {
            transport,
            collection: collection.to_string(),
            collection_url,
            config,
            state,
            downloader,
            info_configuration: InfoConfiguration::default(),
            info_collections: None,
            outgoing: Mutex::new(Vec::new()),
        })
    }

    /// Supplies the server's `info/configuration` upload limits.
    pub fn with_info_configuration(mut self, limits: InfoConfiguration) -> Self {
        self.info_configuration = limits;
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

    /// Returns the batching configuration.
    pub fn config(&self) -> &Server15Config {
        &self.config
    }

    fn uploader(&self) -> BatchingUploader {
        BatchingUploader::new(
            self.transport.clone(),
            self.collection.clone(),
            self.collection_url.clone(),
            self.info_configuration,
        )
    }
}

impl SyncProtocol for Server15Protocol {
    fn last_sync_timestamp(&self, ctx: &SessionContext) -> i64 {
        let last_sync = ctx.last_sync();
        if !self.config.uses_high_water_mark() {
            return last_sync;
        }
        match self.state.get_long(HIGH_WATER_MARK) {
            Some(high_water_mark) if high_water_mark > last_sync => {
                debug!(collection = %self.collection, high_water_mark, last_sync, "using high-water-mark");
                high_water_mark
            }
            _ => last_sync,
        }
    }

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
        self.downloader.fetch_since(ctx, since, delegate)
    }

    fn fetch(
        &self,
        ctx: &SessionContext,
        guids: &[String],
        delegate: &Arc<dyn FetchRecordsDelegate>,
    ) -> SyncResult<i64> {
        let url = CollectionQuery::new()
            .full()
            .ids(guids.iter().cloned())
            .to_url(&self.collection_url);
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
            .unwrap_or_else(|| ctx.last_sync());
        let summary = stream_records(ctx, &self.collection, response, &pending, delegate)?;
        let batch_delegate = Arc::clone(delegate);
        ctx.deliver_and_wait(move || batch_delegate.on_batch_completed())?;
        info!(collection = %self.collection, requested = guids.len(), records = summary.count, "fetched by id");
        Ok(end)
    }

    fn store(&self, _ctx: &SessionContext, record: Record) -> SyncResult<()> {
        self.outgoing.lock().push(record);
        Ok(())
    }

    fn store_done(&self, ctx: &SessionContext) -> SyncResult<Option<i64>> {
        let records = std::mem::take(&mut *self.outgoing.lock());
        if records.is_empty() {
            return Ok(None);
        }
        self.uploader()
            .upload(ctx, &records, self.downloader.collection_modified())
    }

    fn abort(&self, _ctx: &SessionContext) {
        self.outgoing.lock().clear();
    }
}
