//! The Reading List sync pipeline.
//!
//! A sync runs five stages in a fixed order on one serial queue:
//!
//! 1. upload deletions
//! 2. upload status changes (unread, favorite)
//! 3. upload new articles
//! 4. download changes since the last checkpoint
//! 5. upload material changes (excerpt, resolved url and title)
//!
//! Each stage flushes its change accumulator exactly once. A stage with
//! per-item failures fails and the sync stops there; later stages wait for
//! the next sync. Rejected credentials also end the current stage early.

use super::client::{DownloadOutcome, ItemOutcome, ReadingListClient};
use super::storage::{ReadingListChangeAccumulator, ReadingListStorage};
use crate::error::{SyncError, SyncResult};
use crate::queue::SerialQueue;
use crate::state_provider::{RepositoryStateProvider, StagedWrites};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Delete articles deleted locally.
    UploadDeletions,
    /// Patch status fields.
    UploadUnreadChanges,
    /// Create articles added locally.
    UploadNewItems,
    /// Fetch server changes.
    DownloadIncoming,
    /// Patch material fields.
    UploadModified,
}

impl Stage {
    /// Every stage in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::UploadDeletions,
        Stage::UploadUnreadChanges,
        Stage::UploadNewItems,
        Stage::DownloadIncoming,
        Stage::UploadModified,
    ];

    /// Returns the stage name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::UploadDeletions => "upload_deletions",
            Stage::UploadUnreadChanges => "upload_unread_changes",
            Stage::UploadNewItems => "upload_new_items",
            Stage::DownloadIncoming => "download_incoming",
            Stage::UploadModified => "upload_modified",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a stage tells the sequencer.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The stage finished cleanly.
    Continue,
    /// The stage failed.
    Fail(SyncError),
}

/// Receives the progress of a sync.
pub trait ReadingListSynchronizerDelegate: Send + Sync {
    /// A stage failed; no further stages ran.
    fn on_unable_to_sync(&self, error: SyncError);

    /// A stage finished cleanly.
    fn on_stage_complete(&self, stage: Stage);

    /// Every stage ran.
    fn on_complete(&self);
}

/// Returns the state key of the download checkpoint for `collection`.
pub fn checkpoint_key(collection: &str) -> String {
    format!("lastModified.{}", collection)
}

fn stops_sync(error: &SyncError) -> bool {
    matches!(error, SyncError::AuthenticationInvalid(_)) || error.is_fatal()
}

/// Per-stage bookkeeping: a failure counter and at most one error that
/// ends the stage early.
#[derive(Default)]
struct StageRun {
    failures: usize,
    fatal: Option<SyncError>,
}

impl StageRun {
    fn fail_item(&mut self, stage: Stage, guid: Option<&str>, error: &SyncError) {
        warn!(stage = %stage, ?guid, %error, "item failed");
        self.failures += 1;
    }

    /// Records a request error. Returns false if the stage must stop.
    fn request_error(&mut self, stage: Stage, guid: Option<&str>, error: SyncError) -> bool {
        if stops_sync(&error) {
            warn!(stage = %stage, %error, "stopping sync");
            self.fatal = Some(error);
            false
        } else {
            self.fail_item(stage, guid, &error);
            true
        }
    }

    fn finish(
        self,
        stage: Stage,
        acc: &mut Box<dyn ReadingListChangeAccumulator>,
    ) -> StageOutcome {
        let flushed = acc.finish();
        if let Some(error) = self.fatal {
            return StageOutcome::Fail(error);
        }
        if let Err(error) = flushed {
            return StageOutcome::Fail(error);
        }
        if self.failures > 0 {
            return StageOutcome::Fail(SyncError::StageFailed {
                stage: stage.name().to_string(),
                failures: self.failures,
            });
        }
        StageOutcome::Continue
    }
}

struct Pipeline {
    client: ReadingListClient,
    storage: Arc<dyn ReadingListStorage>,
    state: Arc<dyn RepositoryStateProvider>,
    collection: String,
}

impl Pipeline {
    fn run(&self, delegate: &dyn ReadingListSynchronizerDelegate) {
        info!(collection = %self.collection, "reading list sync started");
        for stage in Stage::ALL {
            match self.run_stage(stage) {
                StageOutcome::Continue => {
                    debug!(stage = %stage, "stage complete");
                    delegate.on_stage_complete(stage);
                }
                StageOutcome::Fail(error) => {
                    warn!(stage = %stage, %error, "stage failed, stopping sync");
                    delegate.on_unable_to_sync(error);
                    return;
                }
            }
        }
        info!(collection = %self.collection, "reading list sync complete");
        delegate.on_complete();
    }

    fn run_stage(&self, stage: Stage) -> StageOutcome {
        match stage {
            Stage::UploadDeletions => self.upload_deletions(),
            Stage::UploadUnreadChanges => self.upload_unread_changes(),
            Stage::UploadNewItems => self.upload_new_items(),
            Stage::DownloadIncoming => self.download_incoming(),
            Stage::UploadModified => self.upload_modified(),
        }
    }

    fn upload_deletions(&self) -> StageOutcome {
        let stage = Stage::UploadDeletions;
        let items = match self.storage.deleted_items() {
            Ok(items) => items,
            Err(error) => return StageOutcome::Fail(error),
        };
        let mut acc = self.storage.change_accumulator();
        let mut run = StageRun::default();

        for record in &items {
            let Some(guid) = record.guid() else {
                continue;
            };
            match self.client.delete(guid) {
                // Already gone counts as done.
                Ok(ItemOutcome::Success(_)) | Ok(ItemOutcome::NotFound) => acc.add_deletion(record),
                Ok(ItemOutcome::Failed(error)) => run.fail_item(stage, Some(guid), &error),
                Ok(other) => run.fail_item(stage, Some(guid), &unexpected(other)),
                Err(error) => {
                    if !run.request_error(stage, Some(guid), error) {
                        break;
                    }
                }
            }
        }
        run.finish(stage, &mut acc)
    }

    fn upload_unread_changes(&self) -> StageOutcome {
        let stage = Stage::UploadUnreadChanges;
        let items = match self.storage.status_changed_items() {
            Ok(items) => items,
            Err(error) => return StageOutcome::Fail(error),
        };
        let mut acc = self.storage.change_accumulator();
        let mut run = StageRun::default();

        for record in &items {
            let Some(guid) = record.guid() else {
                continue;
            };
            match self.client.patch(guid, &record.to_status_patch_json(), None) {
                Ok(ItemOutcome::Success(_)) => acc.add_uploaded_record(record),
                Ok(ItemOutcome::Failed(error)) => run.fail_item(stage, Some(guid), &error),
                Ok(other) => run.fail_item(stage, Some(guid), &unexpected(other)),
                Err(error) => {
                    if !run.request_error(stage, Some(guid), error) {
                        break;
                    }
                }
            }
        }
        run.finish(stage, &mut acc)
    }

    fn upload_new_items(&self) -> StageOutcome {
        let stage = Stage::UploadNewItems;
        let items = match self.storage.new_items() {
            Ok(items) => items,
            Err(error) => return StageOutcome::Fail(error),
        };
        let mut acc = self.storage.change_accumulator();
        let mut run = StageRun::default();

        for record in &items {
            match self.client.add(record) {
                Ok(ItemOutcome::Success(Some(server))) => {
                    acc.add_changed_record(record.given_server_record(&server))
                }
                Ok(ItemOutcome::Conflict) => {
                    debug!(url = ?record.url(), "server already has this article");
                    acc.add_deletion(record);
                }
                Ok(ItemOutcome::Failed(error)) => run.fail_item(stage, None, &error),
                Ok(other) => run.fail_item(stage, None, &unexpected(other)),
                Err(error) => {
                    if !run.request_error(stage, None, error) {
                        break;
                    }
                }
            }
        }
        run.finish(stage, &mut acc)
    }

    fn download_incoming(&self) -> StageOutcome {
        let stage = Stage::DownloadIncoming;
        let key = checkpoint_key(&self.collection);
        let since = self.state.get_long(&key);
        let mut acc = self.storage.change_accumulator();
        let mut run = StageRun::default();
        let mut checkpoint = None;

        match self.client.get_since(since) {
            Ok(DownloadOutcome::NotModified) => debug!(?since, "nothing changed"),
            Ok(DownloadOutcome::Records {
                records,
                last_modified,
                total_records,
            }) => {
                if let Some(total) = total_records {
                    if total != records.len() as i64 {
                        warn!(total, received = records.len(), "record count mismatch");
                    }
                }
                for record in records {
                    acc.add_downloaded_record(record);
                }
                checkpoint = last_modified;
            }
            Ok(DownloadOutcome::Failed(error)) => run.fail_item(stage, None, &error),
            Err(error) => {
                run.request_error(stage, None, error);
            }
        }

        let outcome = run.finish(stage, &mut acc);
        if outcome == StageOutcome::Continue {
            if let Some(last_modified) = checkpoint {
                if let Err(error) = self.advance_checkpoint(&key, last_modified) {
                    return StageOutcome::Fail(error);
                }
            }
        }
        outcome
    }

    fn advance_checkpoint(&self, key: &str, last_modified: i64) -> SyncResult<()> {
        self.state
            .commit(StagedWrites::new().put_long(key, last_modified))?;
        debug!(%key, last_modified, "advanced download checkpoint");
        Ok(())
    }

    fn upload_modified(&self) -> StageOutcome {
        let stage = Stage::UploadModified;
        let items = match self.storage.modified_items() {
            Ok(items) => items,
            Err(error) => return StageOutcome::Fail(error),
        };
        let mut acc = self.storage.change_accumulator();
        let mut run = StageRun::default();

        for record in &items {
            let Some(guid) = record.guid() else {
                continue;
            };
            let unmodified_since = Some(record.server.last_modified).filter(|t| *t > 0);
            match self
                .client
                .patch(guid, &record.to_material_patch_json(), unmodified_since)
            {
                Ok(ItemOutcome::Success(Some(server))) => {
                    acc.add_changed_record(record.given_server_record(&server))
                }
                Ok(ItemOutcome::Success(None)) => acc.add_changed_record(record.clone()),
                Ok(ItemOutcome::NotFound) => {
                    warn!(%guid, "modified article missing on server");
                }
                Ok(ItemOutcome::Conflict) => acc.add_deletion(record),
                Ok(ItemOutcome::PreconditionFailed) => {
                    run.fail_item(stage, Some(guid), &SyncError::ConcurrentModification)
                }
                Ok(ItemOutcome::Failed(error)) => run.fail_item(stage, Some(guid), &error),
                Err(error) => {
                    if !run.request_error(stage, Some(guid), error) {
                        break;
                    }
                }
            }
        }
        run.finish(stage, &mut acc)
    }
}

fn unexpected(outcome: ItemOutcome) -> SyncError {
    match outcome {
        ItemOutcome::Failed(error) => error,
        ItemOutcome::NotFound => SyncError::from_status(404, "not found"),
        ItemOutcome::Conflict => SyncError::from_status(409, "conflict"),
        ItemOutcome::PreconditionFailed => SyncError::ConcurrentModification,
        ItemOutcome::Success(_) => SyncError::Protocol("success without a record".into()),
    }
}

/// Runs Reading List syncs on a dedicated serial queue.
pub struct ReadingListSynchronizer {
    pipeline: Arc<Pipeline>,
    executor: SerialQueue,
}

impl ReadingListSynchronizer {
    /// Creates a synchronizer for the `articles` collection.
    pub fn new(
        client: ReadingListClient,
        storage: Arc<dyn ReadingListStorage>,
        state: Arc<dyn RepositoryStateProvider>,
    ) -> SyncResult<Self> {
        Ok(Self {
            pipeline: Arc::new(Pipeline {
                client,
                storage,
                state,
                collection: "articles".to_string(),
            }),
            executor: SerialQueue::new("reading-list-sync")?,
        })
    }

    /// Returns the download checkpoint, if one was saved.
    pub fn checkpoint(&self) -> Option<i64> {
        self.pipeline
            .state
            .get_long(&checkpoint_key(&self.pipeline.collection))
    }

    /// Starts a sync. Syncs queued behind each other never overlap.
    pub fn sync(&self, delegate: Arc<dyn ReadingListSynchronizerDelegate>) {
        let pipeline = Arc::clone(&self.pipeline);
        let queued_delegate = Arc::clone(&delegate);
        if !self
            .executor
            .submit(move || pipeline.run(queued_delegate.as_ref()))
        {
            delegate.on_unable_to_sync(SyncError::Executor(
                "reading list executor has shut down".into(),
            ));
        }
    }

    /// Runs a sync on the executor and waits for it to finish.
    pub fn sync_blocking(&self, delegate: Arc<dyn ReadingListSynchronizerDelegate>) -> SyncResult<()> {
        let pipeline = Arc::clone(&self.pipeline);
        self.executor
            .submit_and_wait(move || pipeline.run(delegate.as_ref()))
            .ok_or_else(|| SyncError::Executor("reading list executor has shut down".into()))
    }

    /// Stops the executor once queued syncs have finished.
    pub fn shutdown(&self) {
        self.executor.shutdown();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::reading_list::storage::MemoryReadingListStorage;
    use crate::state_provider::NonPersistentRepositoryStateProvider;
    use crate::transport::{MockHttpClient, MockResponse, Transport};
    use rlsync_protocol::{fields, FieldBag, Method, ServerReadingListRecord};
    use url::Url;

    struct Fixture {
        mock: Arc<MockHttpClient>,
        storage: MemoryReadingListStorage,
        state: Arc<NonPersistentRepositoryStateProvider>,
        synchronizer: ReadingListSynchronizer,
    }

    fn fixture() -> Fixture {
        let mock = Arc::new(MockHttpClient::new());
        let endpoint = Url::parse("https://readinglist.example.com/v1").unwrap();
        let client = ReadingListClient::new(Transport::new(mock.clone()), &endpoint).unwrap();
        let storage = MemoryReadingListStorage::new();
        let state = Arc::new(NonPersistentRepositoryStateProvider::new());
        let synchronizer =
            ReadingListSynchronizer::new(client, Arc::new(storage.clone()), state.clone()).unwrap();
        Fixture {
            mock,
            storage,
            state,
            synchronizer,
        }
    }

    fn article(url: &str) -> FieldBag {
        FieldBag::new().with(fields::URL, url).with(fields::TITLE, "t")
    }

    fn empty_download() -> MockResponse {
        MockResponse::new(200)
            .with_header("Last-Modified", "100")
            .with_body(r#"{"items": []}"#)
    }

    fn run(fixture: &Fixture) -> Arc<RecordingSyncDelegate> {
        let delegate = RecordingSyncDelegate::new();
        fixture.synchronizer.sync_blocking(delegate.clone()).unwrap();
        delegate
    }

    #[test]
    fn deletion_precedes_new_item_upload() {
        let f = fixture();
        let gone = f
            .storage
            .add_synced(ServerReadingListRecord::new("g1", 10, article("https://old.example")));
        f.storage.delete_local(gone);
        let fresh = f.storage.add_local(article("https://new.example"));

        f.mock.push_response(MockResponse::new(200));
        f.mock.push_response(MockResponse::new(201).with_body(
            r#"{"id": "srv1", "last_modified": 50, "url": "https://new.example", "title": "t"}"#,
        ));
        f.mock.push_response(empty_download());

        let delegate = run(&f);
        assert_eq!(delegate.events().last(), Some(&SyncEvent::Complete));

        let requests = f.mock.requests();
        assert_eq!(requests[0].method, Method::Delete);
        assert!(requests[0].url.ends_with("/articles/g1"));
        assert_eq!(requests[1].method, Method::Post);

        let uploaded = f.storage.get(fresh).unwrap();
        assert_eq!(uploaded.guid(), Some("srv1"));
        assert_eq!(uploaded.server.last_modified, 50);
        assert!(f.storage.get(gone).is_none());
    }

    #[test]
    fn checkpoint_advances_to_last_modified() {
        let f = fixture();
        f.mock.push_response(
            MockResponse::new(200)
                .with_header("Last-Modified", "1500")
                .with_body(
                    r#"{"items": [{"id": "a", "last_modified": 1000}, {"id": "b", "last_modified": 2000}]}"#,
                ),
        );

        run(&f);
        assert_eq!(f.synchronizer.checkpoint(), Some(1500));
        assert!(f.storage.by_guid("a").is_some());
        assert!(f.storage.by_guid("b").is_some());

        // The next download starts from the checkpoint.
        f.mock.push_response(MockResponse::new(304));
        let delegate = run(&f);
        assert!(f.mock.requests()[1].url.ends_with("?_since=1500"));
        assert_eq!(delegate.failure(), None);
        assert_eq!(f.synchronizer.checkpoint(), Some(1500));
    }

    #[test]
    fn status_conflict_fails_stage_once() {
        let f = fixture();
        let id = f
            .storage
            .add_synced(ServerReadingListRecord::new("g2", 10, article("https://a.example")));
        f.storage.set_status(id, fields::UNREAD, false);
        f.mock.push_response(MockResponse::new(409));

        let finishes_before = f.storage.finish_count();
        let delegate = run(&f);

        assert_eq!(
            delegate.events(),
            vec![
                SyncEvent::Stage(Stage::UploadDeletions),
                SyncEvent::Unable(SyncError::StageFailed {
                    stage: "upload_unread_changes".into(),
                    failures: 1
                }),
            ]
        );
        let requests = f.mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::Patch);
        // Both stages that ran flushed their accumulator once.
        assert_eq!(f.storage.finish_count() - finishes_before, 2);
        assert_eq!(f.storage.status_changed_items().unwrap().len(), 1);
        assert_eq!(f.synchronizer.checkpoint(), None);
    }

    #[test]
    fn failed_deletion_stops_before_new_items() {
        let f = fixture();
        let gone = f
            .storage
            .add_synced(ServerReadingListRecord::new("g1", 10, article("https://old.example")));
        f.storage.delete_local(gone);
        let fresh = f.storage.add_local(article("https://new.example"));
        f.mock.push_response(MockResponse::new(500));

        let delegate = run(&f);
        assert!(matches!(
            delegate.failure(),
            Some(SyncError::StageFailed { failures: 1, .. })
        ));
        assert!(delegate.completed_stages().is_empty());
        assert!(!delegate.events().contains(&SyncEvent::Complete));

        let requests = f.mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::Delete);
        // Both changes wait for the next sync.
        assert_eq!(f.storage.deleted_items().unwrap().len(), 1);
        assert_eq!(f.storage.get(fresh).unwrap().guid(), None);
    }

    #[test]
    fn auth_failure_stops_sync() {
        let f = fixture();
        let gone = f
            .storage
            .add_synced(ServerReadingListRecord::new("g1", 10, article("https://old.example")));
        f.storage.delete_local(gone);
        f.mock.push_response(MockResponse::new(401));

        let delegate = run(&f);
        assert_eq!(
            delegate.events(),
            vec![SyncEvent::Unable(SyncError::AuthenticationInvalid(401))]
        );
        assert_eq!(f.mock.requests().len(), 1);
        assert_eq!(f.storage.finish_count(), 1);
    }

    #[test]
    fn deletion_of_missing_article_resolves() {
        let f = fixture();
        let gone = f
            .storage
            .add_synced(ServerReadingListRecord::new("g1", 10, article("https://old.example")));
        f.storage.delete_local(gone);
        f.mock.push_response(MockResponse::new(404));
        f.mock.push_response(empty_download());

        let delegate = run(&f);
        assert_eq!(delegate.failure(), None);
        assert!(f.storage.deleted_items().unwrap().is_empty());
    }

    #[test]
    fn duplicate_new_item_is_deleted_locally() {
        let f = fixture();
        let dupe = f.storage.add_local(article("https://dupe.example"));
        f.mock.push_response(MockResponse::new(409));
        f.mock.push_response(empty_download());

        run(&f);
        assert!(f.storage.get(dupe).is_none());
    }

    #[test]
    fn material_changes_are_conditional() {
        let f = fixture();
        let ok = f
            .storage
            .add_synced(ServerReadingListRecord::new("m1", 10, article("https://a.example")));
        let stale = f
            .storage
            .add_synced(ServerReadingListRecord::new("m2", 20, article("https://b.example")));
        f.storage.set_material(ok, fields::EXCERPT, "one");
        f.storage.set_material(stale, fields::EXCERPT, "two");
        f.mock.push_response(empty_download());
        f.mock.push_response(MockResponse::new(200).with_body(
            r#"{"id": "m1", "last_modified": 300, "url": "https://a.example", "excerpt": "one"}"#,
        ));
        f.mock.push_response(MockResponse::new(412));

        let delegate = run(&f);
        assert!(matches!(
            delegate.failure(),
            Some(SyncError::StageFailed { failures: 1, .. })
        ));
        assert_eq!(delegate.completed_stages().len(), Stage::ALL.len() - 1);
        let patches: Vec<_> = f
            .mock
            .requests()
            .into_iter()
            .filter(|r| r.method == Method::Patch)
            .collect();
        assert_eq!(patches[0].header("if-unmodified-since"), Some("10"));
        assert_eq!(f.storage.get(ok).unwrap().server.last_modified, 300);
        assert_eq!(f.storage.modified_items().unwrap().len(), 1);
        assert!(f.state.get_long(&checkpoint_key("articles")).is_some());
    }
}
