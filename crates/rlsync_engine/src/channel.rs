//! One-directional record flow between two sessions.

use crate::error::SyncError;
use crate::session::{FetchRecordsDelegate, RepositorySession, StoreDelegate, SyncProtocol};
use crate::versioning::VersioningDelegateHelper;
use parking_lot::Mutex;
use rlsync_protocol::Record;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a completed flow did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowSummary {
    /// End timestamp reported by the source fetch.
    pub fetch_end: i64,
    /// End timestamp reported by the sink's `store_done`.
    pub store_end: i64,
    /// Records fetched from the source.
    pub fetched: usize,
    /// Records the sink stored (including reconciled ones).
    pub stored: usize,
    /// Records the sink failed to store.
    pub failed: usize,
}

/// Receives the outcome of a flow.
pub trait RecordsChannelDelegate: Send + Sync {
    /// Every fetched record was handed to the sink and the sink completed.
    fn on_flow_completed(&self, summary: FlowSummary);

    /// The source fetch failed. The sink was not told `store_done`.
    fn on_flow_fetch_failed(&self, error: SyncError);

    /// The sink could not complete.
    fn on_flow_store_failed(&self, error: SyncError);
}

/// Moves records from a source session into a sink session.
///
/// Each fetched record is stored in the sink. At the end of every fetched
/// page the source waits until the sink has applied all stores, so a
/// resumable source never checkpoints past records that were not stored.
pub struct RecordsChannel<S: SyncProtocol, K: SyncProtocol> {
    source: Arc<RepositorySession<S>>,
    sink: Arc<RepositorySession<K>>,
    delegate: Arc<dyn RecordsChannelDelegate>,
    versioning: Option<VersioningDelegateHelper>,
}

impl<S: SyncProtocol, K: SyncProtocol> RecordsChannel<S, K> {
    /// Creates a channel.
    pub fn new(
        source: Arc<RepositorySession<S>>,
        sink: Arc<RepositorySession<K>>,
        delegate: Arc<dyn RecordsChannelDelegate>,
    ) -> Self {
        Self {
            source,
            sink,
            delegate,
            versioning: None,
        }
    }

    /// Tracks local versions of the flowing records with `helper`.
    pub fn with_versioning(mut self, helper: VersioningDelegateHelper) -> Self {
        self.versioning = Some(helper);
        self
    }

    /// Starts the flow of everything the source changed after `since`.
    ///
    /// Returns immediately; the outcome reaches the channel delegate.
    pub fn flow(&self, since: i64) {
        info!(since, "starting flow");
        let stats = Arc::new(FlowStats::default());
        let store_delegate: Arc<dyn StoreDelegate> = Arc::new(ChannelStoreDelegate {
            stats: Arc::clone(&stats),
            delegate: Arc::clone(&self.delegate),
        });
        let store_delegate = match &self.versioning {
            Some(helper) => helper.wrap_store(store_delegate),
            None => store_delegate,
        };

        let fetch_delegate: Arc<dyn FetchRecordsDelegate> = Arc::new(ChannelFetchDelegate {
            sink: Arc::clone(&self.sink),
            store_delegate,
            stats,
            delegate: Arc::clone(&self.delegate),
        });
        let fetch_delegate = match &self.versioning {
            Some(helper) => helper.wrap_fetch(fetch_delegate),
            None => fetch_delegate,
        };
        self.source.fetch_since(since, fetch_delegate);
    }
}

#[derive(Debug, Default)]
struct FlowStats {
    fetched: AtomicUsize,
    stored: AtomicUsize,
    failed: AtomicUsize,
    fetch_end: Mutex<i64>,
}

struct ChannelFetchDelegate<K: SyncProtocol> {
    sink: Arc<RepositorySession<K>>,
    store_delegate: Arc<dyn StoreDelegate>,
    stats: Arc<FlowStats>,
    delegate: Arc<dyn RecordsChannelDelegate>,
}

impl<K: SyncProtocol> FetchRecordsDelegate for ChannelFetchDelegate<K> {
    fn on_record_fetched(&self, record: Record) {
        self.stats.fetched.fetch_add(1, Ordering::SeqCst);
        let guid = record.guid.clone();
        if let Err(error) = self.sink.store(record) {
            warn!(?guid, %error, "sink refused record");
            self.stats.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_batch_completed(&self) {
        if let Err(error) = self.sink.wait_for_stores() {
            warn!(%error, "sink stopped before the page was stored");
        }
    }

    fn on_fetch_failed(&self, error: SyncError) {
        warn!(%error, "flow fetch failed");
        self.delegate.on_flow_fetch_failed(error);
    }

    fn on_fetch_completed(&self, end: i64) {
        *self.stats.fetch_end.lock() = end;
        debug!(end, fetched = self.stats.fetched.load(Ordering::SeqCst), "flow fetch completed");
        self.sink.store_done(Arc::clone(&self.store_delegate));
    }
}

struct ChannelStoreDelegate {
    stats: Arc<FlowStats>,
    delegate: Arc<dyn RecordsChannelDelegate>,
}

impl StoreDelegate for ChannelStoreDelegate {
    fn on_record_store_succeeded(&self, _guid: &str) {
        self.stats.stored.fetch_add(1, Ordering::SeqCst);
    }

    fn on_record_store_reconciled(&self, _guid: &str, _old_guid: Option<&str>, _local_version: Option<i64>) {
        self.stats.stored.fetch_add(1, Ordering::SeqCst);
    }

    fn on_record_store_failed(&self, error: SyncError, guid: Option<&str>) {
        debug!(?guid, %error, "record not stored");
        self.stats.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_store_completed(&self, end: i64) {
        let summary = FlowSummary {
            fetch_end: *self.stats.fetch_end.lock(),
            store_end: end,
            fetched: self.stats.fetched.load(Ordering::SeqCst),
            stored: self.stats.stored.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
        };
        info!(?summary, "flow completed");
        self.delegate.on_flow_completed(summary);
    }

    fn on_store_failed(&self, error: SyncError) {
        warn!(%error, "flow store failed");
        self.delegate.on_flow_store_failed(error);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::time::Duration;

    pub struct RecordingChannelDelegate {
        tx: Mutex<Sender<Result<FlowSummary, SyncError>>>,
    }

    impl RecordingChannelDelegate {
        pub fn new() -> (Arc<Self>, Receiver<Result<FlowSummary, SyncError>>) {
            let (tx, rx) = channel();
            (Arc::new(Self { tx: Mutex::new(tx) }), rx)
        }
    }

    impl RecordsChannelDelegate for RecordingChannelDelegate {
        fn on_flow_completed(&self, summary: FlowSummary) {
            let _ = self.tx.lock().send(Ok(summary));
        }
        fn on_flow_fetch_failed(&self, error: SyncError) {
            let _ = self.tx.lock().send(Err(error));
        }
        fn on_flow_store_failed(&self, error: SyncError) {
            let _ = self.tx.lock().send(Err(error));
        }
    }

    pub fn wait_flow(rx: &Receiver<Result<FlowSummary, SyncError>>) -> Result<FlowSummary, SyncError> {
        rx.recv_timeout(Duration::from_secs(5))
            .unwrap_or(Err(SyncError::Cancelled))
    }
}
