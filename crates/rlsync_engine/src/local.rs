//! Local record stores and the session protocol over them.

use crate::error::{SyncError, SyncResult};
use crate::reconcile::{reconcile_records, Reconciliation};
use crate::session::{FetchRecordsDelegate, SessionContext, StoreEvent, SyncProtocol};
use parking_lot::RwLock;
use rlsync_protocol::timestamp::now_millis;
use rlsync_protocol::Record;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// The local side of a sync.
///
/// Every write bumps the row's `local_version`. `android_id` identifies a
/// row independently of its guid, which can change when a local record is
/// matched to a remote one.
pub trait LocalRecordStore: Send + Sync {
    /// Returns the row holding `guid`, including tombstones.
    fn find_by_guid(&self, guid: &str) -> SyncResult<Option<Record>>;

    /// Returns a live row with the same content under a different guid.
    fn find_by_content(&self, record: &Record) -> SyncResult<Option<Record>>;

    /// Inserts a new row, assigning a row id and, if missing, a guid.
    fn insert(&self, record: Record) -> SyncResult<Record>;

    /// Replaces the row identified by `record.android_id`.
    fn update(&self, record: Record) -> SyncResult<Record>;

    /// Turns the row holding `guid` into a tombstone.
    ///
    /// Returns `None` if there was no live row.
    fn delete(&self, guid: &str) -> SyncResult<Option<Record>>;

    /// Returns rows modified after `since` that have unsynced changes.
    fn changed_since(&self, since: i64) -> SyncResult<Vec<Record>>;

    /// Marks the given guid versions as synced in one atomic update.
    ///
    /// Returns the number of rows updated.
    fn update_sync_versions(&self, versions: &HashMap<String, i64>) -> SyncResult<usize>;
}

#[derive(Debug, Clone)]
struct Row {
    record: Record,
    synced_version: i64,
}

impl Row {
    fn has_unsynced_changes(&self) -> bool {
        self.record.local_version.unwrap_or(0) > self.synced_version
    }
}

/// An in-memory [`LocalRecordStore`].
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    rows: RwLock<BTreeMap<i64, Row>>,
    dedupe_fields: Vec<String>,
}

impl MemoryLocalStore {
    /// Creates an empty store that deduplicates on the whole payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deduplicates on the given payload fields only.
    pub fn with_dedupe_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dedupe_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Returns every row, tombstones included, in row id order.
    pub fn all(&self) -> Vec<Record> {
        self.rows.read().values().map(|row| row.record.clone()).collect()
    }

    /// Number of live rows.
    pub fn live_count(&self) -> usize {
        self.rows
            .read()
            .values()
            .filter(|row| !row.record.deleted)
            .count()
    }

    /// Returns the synced version of `guid`.
    pub fn synced_version(&self, guid: &str) -> Option<i64> {
        self.rows
            .read()
            .values()
            .find(|row| row.record.guid.as_deref() == Some(guid))
            .map(|row| row.synced_version)
    }

    fn same_content(&self, a: &Record, b: &Record) -> bool {
        if self.dedupe_fields.is_empty() {
            return a.equal_payloads(b);
        }
        self.dedupe_fields
            .iter()
            .all(|field| a.payload.get(field) == b.payload.get(field))
    }
}

impl LocalRecordStore for MemoryLocalStore {
    fn find_by_guid(&self, guid: &str) -> SyncResult<Option<Record>> {
        Ok(self
            .rows
            .read()
            .values()
            .find(|row| row.record.guid.as_deref() == Some(guid))
            .map(|row| row.record.clone()))
    }

    fn find_by_content(&self, record: &Record) -> SyncResult<Option<Record>> {
        Ok(self
            .rows
            .read()
            .values()
            .find(|row| {
                !row.record.deleted
                    && row.record.guid != record.guid
                    && self.same_content(&row.record, record)
            })
            .map(|row| row.record.clone()))
    }

    fn insert(&self, mut record: Record) -> SyncResult<Record> {
        let mut rows = self.rows.write();
        let id = rows.keys().next_back().map_or(1, |last| last + 1);
        if record.guid.is_none() {
            record.guid = Some(Uuid::new_v4().simple().to_string());
        }
        if record.last_modified == 0 {
            record.last_modified = now_millis();
        }
        record.android_id = Some(id);
        record.local_version = Some(1);
        rows.insert(
            id,
            Row {
                record: record.clone(),
                synced_version: 0,
            },
        );
        trace!(id, guid = ?record.guid, "inserted local row");
        Ok(record)
    }

    fn update(&self, mut record: Record) -> SyncResult<Record> {
        let id = record
            .android_id
            .ok_or_else(|| SyncError::Storage("update without a row id".to_string()))?;
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| SyncError::Storage(format!("no local row {}", id)))?;
        record.local_version = Some(row.record.local_version.unwrap_or(0) + 1);
        row.record = record.clone();
        Ok(record)
    }

    fn delete(&self, guid: &str) -> SyncResult<Option<Record>> {
        let mut rows = self.rows.write();
        let Some(row) = rows
            .values_mut()
            .find(|row| row.record.guid.as_deref() == Some(guid))
        else {
            return Ok(None);
        };
        if row.record.deleted {
            return Ok(None);
        }
        row.record.deleted = true;
        row.record.payload.clear();
        row.record.last_modified = now_millis();
        row.record.local_version = Some(row.record.local_version.unwrap_or(0) + 1);
        Ok(Some(row.record.clone()))
    }

    fn changed_since(&self, since: i64) -> SyncResult<Vec<Record>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|row| row.record.last_modified > since && row.has_unsynced_changes())
            .map(|row| row.record.clone())
            .collect())
    }

    fn update_sync_versions(&self, versions: &HashMap<String, i64>) -> SyncResult<usize> {
        let mut rows = self.rows.write();
        let mut updated = 0;
        for row in rows.values_mut() {
            let Some(guid) = row.record.guid.as_deref() else {
                continue;
            };
            if let Some(version) = versions.get(guid) {
                row.synced_version = *version;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

/// Session protocol over a [`LocalRecordStore`].
///
/// Fetches return locally changed records, skipping guids this session has
/// already stored. Stores apply remote records: new records are inserted,
/// tombstones delete, and records matching a local row (by guid or by
/// content) are reconciled with it.
pub struct LocalProtocol {
    store: Arc<dyn LocalRecordStore>,
}

impl LocalProtocol {
    /// Creates a protocol over `store`.
    pub fn new(store: Arc<dyn LocalRecordStore>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn LocalRecordStore> {
        &self.store
    }

    fn deliver_all(
        &self,
        ctx: &SessionContext,
        records: Vec<Record>,
        delegate: &Arc<dyn FetchRecordsDelegate>,
    ) -> usize {
        let mut delivered = 0;
        for record in records {
            if record.guid.as_deref().is_some_and(|guid| ctx.is_tracked(guid)) {
                continue;
            }
            let delegate = Arc::clone(delegate);
            ctx.deliver(move || delegate.on_record_fetched(record));
            delivered += 1;
        }
        delivered
    }

    fn store_tombstone(&self, ctx: &SessionContext, guid: &str) -> SyncResult<()> {
        if self.store.delete(guid)?.is_some() {
            debug!(session = %ctx.name(), %guid, "applied remote deletion");
        }
        ctx.track_guid(guid);
        ctx.report_store(StoreEvent::Succeeded(guid.to_string()));
        Ok(())
    }

    /// Applies a remote record over a local tombstone.
    fn store_over_tombstone(
        &self,
        ctx: &SessionContext,
        remote: Record,
        local: Record,
    ) -> SyncResult<()> {
        let guid = remote.require_guid()?.to_string();
        if remote.last_modified.saturating_add(ctx.clock_skew()) > local.last_modified {
            let revived = self.store.update(remote.copy_with_ids(remote.guid.clone(), local.android_id))?;
            ctx.track_guid(guid.as_str());
            ctx.report_store(StoreEvent::Reconciled {
                guid,
                old_guid: None,
                local_version: revived.local_version,
            });
        } else {
            ctx.report_store(StoreEvent::Succeeded(guid));
        }
        Ok(())
    }
}

impl SyncProtocol for LocalProtocol {
    fn fetch_since(
        &self,
        ctx: &SessionContext,
        since: i64,
        delegate: &Arc<dyn FetchRecordsDelegate>,
    ) -> SyncResult<i64> {
        let end = now_millis();
        let changed = self.store.changed_since(since)?;
        let delivered = self.deliver_all(ctx, changed, delegate);
        info!(session = %ctx.name(), since, delivered, "fetched local changes");
        Ok(end)
    }

    fn fetch(
        &self,
        ctx: &SessionContext,
        guids: &[String],
        delegate: &Arc<dyn FetchRecordsDelegate>,
    ) -> SyncResult<i64> {
        let end = now_millis();
        let mut found = Vec::with_capacity(guids.len());
        for guid in guids {
            if let Some(record) = self.store.find_by_guid(guid)? {
                found.push(record);
            }
        }
        self.deliver_all(ctx, found, delegate);
        Ok(end)
    }

    fn store(&self, ctx: &SessionContext, remote: Record) -> SyncResult<()> {
        let guid = remote.require_guid()?.to_string();
        if remote.deleted {
            return self.store_tombstone(ctx, &guid);
        }

        let (local, old_guid) = match self.store.find_by_guid(&guid)? {
            Some(local) if local.deleted => return self.store_over_tombstone(ctx, remote, local),
            Some(local) => (Some(local), None),
            None => match self.store.find_by_content(&remote)? {
                Some(dupe) => {
                    let old = dupe.guid.clone();
                    (Some(dupe), old)
                }
                None => (None, None),
            },
        };

        let Some(local) = local else {
            let inserted = self.store.insert(remote)?;
            ctx.track_guid(guid.as_str());
            ctx.report_store(StoreEvent::Reconciled {
                guid,
                old_guid: None,
                local_version: inserted.local_version,
            });
            return Ok(());
        };

        match reconcile_records(&remote, &local, ctx.clock_skew()) {
            Reconciliation::Unchanged if old_guid.is_none() => {
                ctx.report_store(StoreEvent::Succeeded(guid));
            }
            Reconciliation::Unchanged => {
                // Same content under another guid: adopt the remote guid.
                let mut adopted = local.copy_with_ids(Some(guid.clone()), local.android_id);
                adopted.last_modified = remote.last_modified;
                let written = self.store.update(adopted)?;
                ctx.track_guid(guid.as_str());
                debug!(session = %ctx.name(), %guid, old_guid = ?old_guid, "deduplicated");
                ctx.report_store(StoreEvent::Reconciled {
                    guid,
                    old_guid,
                    local_version: written.local_version,
                });
            }
            Reconciliation::Merged { record, track } => {
                let written = self.store.update(record)?;
                if track {
                    ctx.track_guid(guid.as_str());
                }
                ctx.report_store(StoreEvent::Reconciled {
                    guid,
                    old_guid,
                    local_version: if track { written.local_version } else { None },
                });
            }
        }
        Ok(())
    }

    fn store_done(&self, _ctx: &SessionContext) -> SyncResult<Option<i64>> {
        Ok(Some(now_millis()))
    }
}
