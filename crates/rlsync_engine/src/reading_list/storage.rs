//! Local Reading List storage and change accumulation.

use crate::error::SyncResult;
use parking_lot::Mutex;
use rlsync_protocol::fields;
use rlsync_protocol::timestamp::now_millis;
use rlsync_protocol::{
    ClientMetadata, ClientReadingListRecord, FieldBag, ServerMetadata, ServerReadingListRecord,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Local storage the synchronizer reads pending changes from.
pub trait ReadingListStorage: Send + Sync {
    /// Records deleted locally that the server still has.
    fn deleted_items(&self) -> SyncResult<Vec<ClientReadingListRecord>>;

    /// Uploaded records whose status fields changed locally.
    fn status_changed_items(&self) -> SyncResult<Vec<ClientReadingListRecord>>;

    /// Records never uploaded.
    fn new_items(&self) -> SyncResult<Vec<ClientReadingListRecord>>;

    /// Uploaded records whose material fields changed locally.
    fn modified_items(&self) -> SyncResult<Vec<ClientReadingListRecord>>;

    /// Returns a fresh accumulator for one stage's changes.
    fn change_accumulator(&self) -> Box<dyn ReadingListChangeAccumulator>;
}

/// Collects the local consequences of one stage and applies them in
/// [`finish`](Self::finish).
pub trait ReadingListChangeAccumulator: Send {
    /// The record is gone for good, locally and on the server.
    fn add_deletion(&mut self, record: &ClientReadingListRecord);

    /// Replace the local record with `record`.
    fn add_changed_record(&mut self, record: ClientReadingListRecord);

    /// The record's status fields reached the server.
    fn add_uploaded_record(&mut self, record: &ClientReadingListRecord);

    /// Apply a record downloaded from the server.
    fn add_downloaded_record(&mut self, record: ServerReadingListRecord);

    /// Applies everything collected so far.
    fn finish(&mut self) -> SyncResult<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    record: ClientReadingListRecord,
    status_dirty: bool,
    material_dirty: bool,
}

#[derive(Debug, Default)]
struct Table {
    entries: BTreeMap<i64, Entry>,
    next_id: i64,
    finishes: usize,
}

impl Table {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn id_of_guid(&self, guid: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|(_, e)| e.record.guid() == Some(guid))
            .map(|(id, _)| *id)
    }

    fn select<F>(&self, filter: F) -> Vec<ClientReadingListRecord>
    where
        F: Fn(&Entry) -> bool,
    {
        self.entries
            .values()
            .filter(|e| filter(e))
            .map(|e| e.record.clone())
            .collect()
    }
}

/// An in-memory [`ReadingListStorage`].
#[derive(Debug, Default, Clone)]
pub struct MemoryReadingListStorage {
    table: Arc<Mutex<Table>>,
}

impl MemoryReadingListStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a locally created article, returning its row id.
    pub fn add_local(&self, fields: FieldBag) -> i64 {
        let mut table = self.table.lock();
        let id = table.allocate_id();
        let record = ClientReadingListRecord::new(
            ClientMetadata {
                id,
                last_modified: now_millis(),
                ..ClientMetadata::default()
            },
            ServerMetadata::default(),
            fields,
        );
        table.entries.insert(
            id,
            Entry {
                record,
                status_dirty: false,
                material_dirty: false,
            },
        );
        id
    }

    /// Adds an article already known to the server, returning its row id.
    pub fn add_synced(&self, server: ServerReadingListRecord) -> i64 {
        let mut table = self.table.lock();
        let id = table.allocate_id();
        let record = ClientReadingListRecord::new(
            ClientMetadata {
                id,
                last_modified: server.server.last_modified,
                ..ClientMetadata::default()
            },
            server.server,
            server.fields,
        );
        table.entries.insert(
            id,
            Entry {
                record,
                status_dirty: false,
                material_dirty: false,
            },
        );
        id
    }

    /// Marks a row deleted. Rows never uploaded are dropped outright.
    pub fn delete_local(&self, id: i64) {
        let mut table = self.table.lock();
        let Some(entry) = table.entries.get_mut(&id) else {
            return;
        };
        if entry.record.guid().is_none() {
            table.entries.remove(&id);
            return;
        }
        entry.record.client.is_deleted = true;
        entry.record.client.last_modified = now_millis();
    }

    /// Sets a status field (`unread`, `favorite`, ...) locally.
    pub fn set_status(&self, id: i64, field: &str, value: impl Into<Value>) {
        self.modify(id, field, value.into(), true);
    }

    /// Sets a material field (`excerpt`, `resolved_url`, ...) locally.
    pub fn set_material(&self, id: i64, field: &str, value: impl Into<Value>) {
        self.modify(id, field, value.into(), false);
    }

    fn modify(&self, id: i64, field: &str, value: Value, status: bool) {
        let mut table = self.table.lock();
        if let Some(entry) = table.entries.get_mut(&id) {
            entry.record.fields.set(field, value);
            entry.record.client.last_modified = now_millis();
            if status {
                entry.status_dirty = true;
            } else {
                entry.material_dirty = true;
            }
        }
    }

    /// Returns the row with `id`.
    pub fn get(&self, id: i64) -> Option<ClientReadingListRecord> {
        self.table.lock().entries.get(&id).map(|e| e.record.clone())
    }

    /// Returns the row holding `guid`.
    pub fn by_guid(&self, guid: &str) -> Option<ClientReadingListRecord> {
        let table = self.table.lock();
        table
            .id_of_guid(guid)
            .and_then(|id| table.entries.get(&id))
            .map(|e| e.record.clone())
    }

    /// Returns every row in id order.
    pub fn all(&self) -> Vec<ClientReadingListRecord> {
        self.table.lock().select(|_| true)
    }

    /// Number of accumulator flushes so far.
    pub fn finish_count(&self) -> usize {
        self.table.lock().finishes
    }
}

impl ReadingListStorage for MemoryReadingListStorage {
    fn deleted_items(&self) -> SyncResult<Vec<ClientReadingListRecord>> {
        Ok(self
            .table
            .lock()
            .select(|e| e.record.client.is_deleted && e.record.guid().is_some()))
    }

    fn status_changed_items(&self) -> SyncResult<Vec<ClientReadingListRecord>> {
        Ok(self.table.lock().select(|e| {
            !e.record.client.is_deleted && e.record.guid().is_some() && e.status_dirty
        }))
    }

    fn new_items(&self) -> SyncResult<Vec<ClientReadingListRecord>> {
        Ok(self
            .table
            .lock()
            .select(|e| !e.record.client.is_deleted && e.record.guid().is_none()))
    }

    fn modified_items(&self) -> SyncResult<Vec<ClientReadingListRecord>> {
        Ok(self.table.lock().select(|e| {
            !e.record.client.is_deleted && e.record.guid().is_some() && e.material_dirty
        }))
    }

    fn change_accumulator(&self) -> Box<dyn ReadingListChangeAccumulator> {
        Box::new(MemoryChangeAccumulator {
            table: Arc::clone(&self.table),
            changes: Vec::new(),
        })
    }
}

#[derive(Debug)]
enum Change {
    Deletion(i64),
    Changed(ClientReadingListRecord),
    Uploaded(i64),
    Downloaded(ServerReadingListRecord),
}

/// Accumulator for [`MemoryReadingListStorage`]; applies all changes under
/// one lock.
#[derive(Debug)]
pub struct MemoryChangeAccumulator {
    table: Arc<Mutex<Table>>,
    changes: Vec<Change>,
}

impl ReadingListChangeAccumulator for MemoryChangeAccumulator {
    fn add_deletion(&mut self, record: &ClientReadingListRecord) {
        self.changes.push(Change::Deletion(record.client.id));
    }

    fn add_changed_record(&mut self, record: ClientReadingListRecord) {
        self.changes.push(Change::Changed(record));
    }

    fn add_uploaded_record(&mut self, record: &ClientReadingListRecord) {
        self.changes.push(Change::Uploaded(record.client.id));
    }

    fn add_downloaded_record(&mut self, record: ServerReadingListRecord) {
        self.changes.push(Change::Downloaded(record));
    }

    fn finish(&mut self) -> SyncResult<()> {
        let mut table = self.table.lock();
        let applied = self.changes.len();
        for change in self.changes.drain(..) {
            match change {
                Change::Deletion(id) => {
                    table.entries.remove(&id);
                }
                Change::Changed(record) => {
                    if let Some(entry) = table.entries.get_mut(&record.client.id) {
                        entry.record = record;
                        entry.material_dirty = false;
                    }
                }
                Change::Uploaded(id) => {
                    if let Some(entry) = table.entries.get_mut(&id) {
                        entry.status_dirty = false;
                    }
                }
                Change::Downloaded(server) => apply_download(&mut table, server),
            }
        }
        table.finishes += 1;
        debug!(applied, "reading list changes applied");
        Ok(())
    }
}

fn apply_download(table: &mut Table, server: ServerReadingListRecord) {
    let Some(guid) = server.guid().map(str::to_string) else {
        return;
    };
    let existing = table.id_of_guid(&guid);
    if server.deleted {
        if let Some(id) = existing {
            table.entries.remove(&id);
        }
        return;
    }
    match existing {
        Some(id) => {
            if let Some(entry) = table.entries.get_mut(&id) {
                let mut merged = server.fields;
                // Unsent local status changes survive the download.
                if entry.status_dirty {
                    for key in fields::STATUS_FIELDS {
                        if let Some(value) = entry.record.fields.get(key) {
                            merged.set(key, value.clone());
                        }
                    }
                }
                entry.record.server = server.server;
                entry.record.fields = merged;
            }
        }
        None => {
            let id = table.allocate_id();
            let record = ClientReadingListRecord::new(
                ClientMetadata {
                    id,
                    last_modified: server.server.last_modified,
                    ..ClientMetadata::default()
                },
                server.server,
                server.fields,
            );
            table.entries.insert(
                id,
                Entry {
                    record,
                    status_dirty: false,
                    material_dirty: false,
                },
            );
        }
    }
}
