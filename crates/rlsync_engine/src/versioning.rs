//! Synced-version bookkeeping for versioned local stores.
//!
//! A local store bumps a record's `local_version` on every write. The helper
//! remembers which version of each record went out (or came in), and once the
//! server has acknowledged the batch, marks exactly those versions as synced.
//! A record written again in the meantime keeps a newer version and is
//! uploaded again next time.

use crate::error::{SyncError, SyncResult};
use crate::local::LocalRecordStore;
use crate::session::{FetchRecordsDelegate, StoreDelegate};
use parking_lot::Mutex;
use rlsync_protocol::Record;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

type VersionMap = Arc<Mutex<HashMap<String, i64>>>;

/// Tracks guid to local-version pairs across one upload or download.
#[derive(Debug, Default, Clone)]
pub struct VersioningDelegateHelper {
    versions: VersionMap,
}

impl VersioningDelegateHelper {
    /// Creates a helper with an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of guids tracked.
    pub fn len(&self) -> usize {
        self.versions.lock().len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.versions.lock().is_empty()
    }

    /// Returns the version tracked for `guid`.
    pub fn version_of(&self, guid: &str) -> Option<i64> {
        self.versions.lock().get(guid).copied()
    }

    /// Wraps a fetch delegate so every fetched record's version is recorded.
    ///
    /// A record without a local version fails the fetch once; nothing after
    /// it reaches `inner`.
    pub fn wrap_fetch(&self, inner: Arc<dyn FetchRecordsDelegate>) -> Arc<dyn FetchRecordsDelegate> {
        Arc::new(VersionedFetchDelegate {
            inner,
            versions: Arc::clone(&self.versions),
            failed: AtomicBool::new(false),
        })
    }

    /// Wraps a store delegate so reconciled records update the map.
    pub fn wrap_store(&self, inner: Arc<dyn StoreDelegate>) -> Arc<dyn StoreDelegate> {
        Arc::new(VersionedStoreDelegate {
            inner,
            versions: Arc::clone(&self.versions),
        })
    }

    /// Marks every tracked version as synced in `store`.
    ///
    /// Call only after the upload has committed. The store must update one
    /// row per tracked guid, and the map must not change during the call.
    pub fn persist_sync_versions(&self, store: &dyn LocalRecordStore) -> SyncResult<usize> {
        let snapshot = self.versions.lock().clone();
        if snapshot.is_empty() {
            return Ok(0);
        }
        let updated = store.update_sync_versions(&snapshot)?;
        let current = self.versions.lock().len();

        if updated != snapshot.len() {
            error!(expected = snapshot.len(), updated, "sync version update count mismatch");
            return Err(SyncError::VersionMapInvariant(format!(
                "updated {} rows for {} tracked guids",
                updated,
                snapshot.len()
            )));
        }
        if current != snapshot.len() {
            error!(before = snapshot.len(), after = current, "version map changed during persist");
            return Err(SyncError::VersionMapInvariant(format!(
                "map size changed from {} to {} while persisting",
                snapshot.len(),
                current
            )));
        }
        debug!(updated, "persisted sync versions");
        Ok(updated)
    }
}

struct VersionedFetchDelegate {
    inner: Arc<dyn FetchRecordsDelegate>,
    versions: VersionMap,
    failed: AtomicBool,
}

impl FetchRecordsDelegate for VersionedFetchDelegate {
    fn on_record_fetched(&self, record: Record) {
        if self.failed.load(Ordering::SeqCst) {
            return;
        }
        match (&record.guid, record.local_version) {
            (Some(guid), Some(version)) => {
                self.versions.lock().insert(guid.clone(), version);
                self.inner.on_record_fetched(record);
            }
            _ => {
                self.failed.store(true, Ordering::SeqCst);
                let guid = record.guid.unwrap_or_else(|| "<unassigned>".to_string());
                error!(%guid, "fetched record has no local version");
                self.inner
                    .on_fetch_failed(SyncError::UnversionedRecord(guid));
            }
        }
    }

    fn on_batch_completed(&self) {
        if !self.failed.load(Ordering::SeqCst) {
            self.inner.on_batch_completed();
        }
    }

    fn on_fetch_failed(&self, error: SyncError) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            self.inner.on_fetch_failed(error);
        }
    }

    fn on_fetch_completed(&self, end: i64) {
        if !self.failed.load(Ordering::SeqCst) {
            self.inner.on_fetch_completed(end);
        }
    }
}

struct VersionedStoreDelegate {
    inner: Arc<dyn StoreDelegate>,
    versions: VersionMap,
}

impl StoreDelegate for VersionedStoreDelegate {
    fn on_record_store_succeeded(&self, guid: &str) {
        self.inner.on_record_store_succeeded(guid);
    }

    fn on_record_store_reconciled(&self, guid: &str, old_guid: Option<&str>, local_version: Option<i64>) {
        {
            let mut versions = self.versions.lock();
            // The old guid no longer names a row, whoever won the merge.
            if let Some(old) = old_guid.filter(|old| *old != guid) {
                versions.remove(old);
            }
            if let Some(version) = local_version {
                versions.insert(guid.to_string(), version);
            }
        }
        self.inner
            .on_record_store_reconciled(guid, old_guid, local_version);
    }

    fn on_record_store_failed(&self, error: SyncError, guid: Option<&str>) {
        // Never acknowledged, so its version must not be marked synced.
        if let Some(guid) = guid {
            self.versions.lock().remove(guid);
        }
        self.inner.on_record_store_failed(error, guid);
    }

    fn on_store_completed(&self, end: i64) {
        self.inner.on_store_completed(end);
    }

    fn on_store_failed(&self, error: SyncError) {
        self.inner.on_store_failed(error);
    }
}
