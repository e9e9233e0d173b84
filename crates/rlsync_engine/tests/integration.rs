//! Integration tests for the rlsync engine.
//!
//! These tests drive the engine against the in-memory reference server
//! through a loopback transport.

use parking_lot::Mutex;
use rlsync_engine::protocol::{
    FieldBag, HttpRequest, HttpResponse, InfoConfiguration, Method, Record,
};
use rlsync_engine::reading_list::{
    MemoryReadingListStorage, ReadingListClient, ReadingListSynchronizer,
    ReadingListSynchronizerDelegate, Stage,
};
use rlsync_engine::{
    BearerAuthHeaderProvider, FlowSummary, LocalProtocol, LocalRecordStore, LoopbackClient,
    LoopbackServer, MemoryLocalStore, NonPersistentRepositoryStateProvider,
    PersistentRepositoryStateProvider, RecordsChannel, RecordsChannelDelegate, RepositorySession,
    RepositoryStateProvider, Server11Protocol, Server15Config, Server15Protocol, SyncError,
    SyncProtocol, Transport, VersioningDelegateHelper, OFFSET,
};
use rlsync_server::{ServerConfig, SyncServer};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const STORAGE_URL: &str = "https://sync.example.com/1.5/42/storage";
const READING_LIST_URL: &str = "https://readinglist.example.com/v1";

/// Runs before every request; a returned response replaces the server's.
type Hook = dyn Fn(&SyncServer, &HttpRequest, usize) -> Option<HttpResponse> + Send + Sync;

/// Routes loopback requests into a shared [`SyncServer`] and records them.
#[derive(Clone)]
struct InMemoryServer {
    server: Arc<SyncServer>,
    requests: Arc<Mutex<Vec<(Method, String)>>>,
    hook: Option<Arc<Hook>>,
}

impl InMemoryServer {
    fn new(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            requests: Arc::new(Mutex::new(Vec::new())),
            hook: None,
        }
    }

    fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&SyncServer, &HttpRequest, usize) -> Option<HttpResponse> + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    fn transport(&self) -> Transport {
        Transport::new(Arc::new(LoopbackClient::new(self.clone())))
    }

    fn requests(&self) -> Vec<(Method, String)> {
        self.requests.lock().clone()
    }

    fn gets(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|(method, _)| *method == Method::Get)
            .map(|(_, url)| url)
            .collect()
    }
}

impl LoopbackServer for InMemoryServer {
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let seen = {
            let mut requests = self.requests.lock();
            requests.push((request.method, request.url.clone()));
            requests.len()
        };
        if let Some(hook) = &self.hook {
            if let Some(response) = hook(&self.server, request, seen) {
                return response;
            }
        }
        self.server.handle(request)
    }
}

fn status(code: u16) -> HttpResponse {
    HttpResponse::from_bytes(code, Vec::<(String, String)>::new(), Vec::new())
}

fn storage_url() -> Url {
    Url::parse(STORAGE_URL).unwrap()
}

fn bookmark(guid: &str, title: &str) -> Record {
    Record::new("bookmarks")
        .with_guid(guid)
        .with_field("title", title)
}

fn seed(server: &SyncServer, count: usize) {
    for i in 0..count {
        server
            .collections()
            .insert(&bookmark(&format!("bookmark{}", i), &format!("title {}", i)))
            .unwrap();
    }
}

// ============================================================================
// Records channels
// ============================================================================

struct FlowRecorder {
    tx: Sender<Result<FlowSummary, SyncError>>,
}

impl FlowRecorder {
    fn new() -> (Arc<Self>, Receiver<Result<FlowSummary, SyncError>>) {
        let (tx, rx) = channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl RecordsChannelDelegate for FlowRecorder {
    fn on_flow_completed(&self, summary: FlowSummary) {
        let _ = self.tx.send(Ok(summary));
    }

    fn on_flow_fetch_failed(&self, error: SyncError) {
        let _ = self.tx.send(Err(error));
    }

    fn on_flow_store_failed(&self, error: SyncError) {
        let _ = self.tx.send(Err(error));
    }
}

fn flow<S: SyncProtocol, K: SyncProtocol>(
    source: S,
    sink: K,
    since: i64,
    versioning: Option<VersioningDelegateHelper>,
) -> Result<FlowSummary, SyncError> {
    let source = Arc::new(RepositorySession::new("source", source).unwrap());
    let sink = Arc::new(RepositorySession::new("sink", sink).unwrap());
    source.begin().unwrap();
    sink.begin().unwrap();

    let (recorder, rx) = FlowRecorder::new();
    let mut records = RecordsChannel::new(source, sink, recorder);
    if let Some(helper) = versioning {
        records = records.with_versioning(helper);
    }
    records.flow(since);
    rx.recv_timeout(Duration::from_secs(10))
        .expect("flow did not finish")
}

fn server15(
    loopback: &InMemoryServer,
    config: Server15Config,
    state: Arc<dyn RepositoryStateProvider>,
) -> Server15Protocol {
    Server15Protocol::new(loopback.transport(), &storage_url(), "bookmarks", config, state).unwrap()
}

#[test]
fn paged_download_fills_local_store() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    seed(&server, 5);
    let loopback = InMemoryServer::new(Arc::clone(&server));
    let state = Arc::new(NonPersistentRepositoryStateProvider::new());
    let local = Arc::new(MemoryLocalStore::new());

    let summary = flow(
        server15(&loopback, Server15Config::new(2), state.clone()),
        LocalProtocol::new(local.clone()),
        0,
        None,
    )
    .unwrap();

    assert_eq!(summary.fetched, 5);
    assert_eq!(summary.stored, 5);
    assert_eq!(local.live_count(), 5);
    assert_eq!(loopback.gets().len(), 3);
    // A finished fetch leaves no resume point behind.
    assert!(state.get_string(OFFSET).is_none());
}

#[test]
fn interrupted_download_resumes_from_saved_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bookmarks.state");
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    seed(&server, 5);
    let local = Arc::new(MemoryLocalStore::new());

    // The second page request fails.
    let failing = InMemoryServer::new(Arc::clone(&server))
        .with_hook(|_, _, seen| (seen == 2).then(|| status(503)));
    let state = Arc::new(PersistentRepositoryStateProvider::open(&path).unwrap());
    let error = flow(
        server15(&failing, Server15Config::new(2), state.clone()),
        LocalProtocol::new(local.clone()),
        0,
        None,
    )
    .unwrap_err();
    assert!(matches!(error, SyncError::Http { status: 503, .. }));
    assert_eq!(local.live_count(), 2);

    // The resume point is on disk before the next attempt.
    assert_eq!(state.get_string(OFFSET).as_deref(), Some("2"));
    assert!(std::fs::read_to_string(&path).unwrap().contains(OFFSET));

    let loopback = InMemoryServer::new(Arc::clone(&server));
    let summary = flow(
        server15(&loopback, Server15Config::new(2), state.clone()),
        LocalProtocol::new(local.clone()),
        0,
        None,
    )
    .unwrap();

    let gets = loopback.gets();
    assert_eq!(gets.len(), 2);
    assert!(gets[0].contains("offset=2"));
    assert_eq!(summary.fetched, 3);
    assert_eq!(local.live_count(), 5);
    assert!(state.get_string(OFFSET).is_none());
}

#[test]
fn write_between_pages_aborts_download() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    seed(&server, 2);
    // Another client writes before the second page is requested.
    let loopback = InMemoryServer::new(Arc::clone(&server)).with_hook(|server, _, seen| {
        if seen == 2 {
            server.collections().insert(&bookmark("late", "late")).unwrap();
        }
        None
    });
    let state = Arc::new(NonPersistentRepositoryStateProvider::new());
    let local = Arc::new(MemoryLocalStore::new());

    let error = flow(
        server15(&loopback, Server15Config::new(1), state.clone()),
        LocalProtocol::new(local.clone()),
        0,
        None,
    )
    .unwrap_err();

    assert_eq!(error, SyncError::ConcurrentModification);
    assert_eq!(local.live_count(), 1);
    assert!(state.get_string(OFFSET).is_none());
}

#[test]
fn local_changes_upload_in_committed_batches() {
    let limits = InfoConfiguration {
        max_post_records: 2,
        ..InfoConfiguration::default()
    };
    let server = Arc::new(SyncServer::new(
        ServerConfig::default().with_limits(limits),
    ));
    let loopback = InMemoryServer::new(Arc::clone(&server));
    let local = Arc::new(MemoryLocalStore::new());
    let store: Arc<dyn LocalRecordStore> = local.clone();
    for i in 0..3 {
        store
            .insert(Record::new("bookmarks").with_field("title", format!("local {}", i)))
            .unwrap();
    }

    let helper = VersioningDelegateHelper::new();
    let remote = server15(
        &loopback,
        Server15Config::default(),
        Arc::new(NonPersistentRepositoryStateProvider::new()),
    )
    .with_info_configuration(limits);
    let summary = flow(
        LocalProtocol::new(local.clone()),
        remote,
        0,
        Some(helper.clone()),
    )
    .unwrap();

    assert_eq!(summary.stored, 3);
    assert_eq!(server.collections().count("bookmarks"), 3);
    assert_eq!(server.collections().open_batches(), 0);
    let posts: Vec<_> = loopback
        .requests()
        .into_iter()
        .filter(|(method, _)| *method == Method::Post)
        .map(|(_, url)| url)
        .collect();
    assert_eq!(posts.len(), 2);
    assert!(posts[1].contains("commit=true"));

    assert_eq!(helper.persist_sync_versions(local.as_ref()).unwrap(), 3);
    assert!(store.changed_since(0).unwrap().is_empty());
    for record in local.all() {
        let guid = record.guid.unwrap();
        assert_eq!(local.synced_version(&guid), Some(1));
    }
}

#[test]
fn server11_round_trip_between_devices() {
    let server = Arc::new(SyncServer::new(
        ServerConfig::default().without_batch_uploads(),
    ));
    let loopback = InMemoryServer::new(Arc::clone(&server));

    let first = Arc::new(MemoryLocalStore::new());
    let store: Arc<dyn LocalRecordStore> = first.clone();
    store.insert(bookmark("shared1", "one")).unwrap();
    store.insert(bookmark("shared2", "two")).unwrap();
    let uploaded = flow(
        LocalProtocol::new(first),
        Server11Protocol::new(loopback.transport(), &storage_url(), "bookmarks").unwrap(),
        0,
        None,
    )
    .unwrap();
    assert_eq!(uploaded.stored, 2);
    assert_eq!(server.collections().count("bookmarks"), 2);

    let second = Arc::new(MemoryLocalStore::new());
    let downloaded = flow(
        Server11Protocol::new(loopback.transport(), &storage_url(), "bookmarks").unwrap(),
        LocalProtocol::new(second.clone()),
        0,
        None,
    )
    .unwrap();
    assert_eq!(downloaded.fetched, 2);

    let mut guids: Vec<_> = second.all().into_iter().filter_map(|r| r.guid).collect();
    guids.sort();
    assert_eq!(guids, vec!["shared1", "shared2"]);
    let record = second
        .all()
        .into_iter()
        .find(|r| r.guid.as_deref() == Some("shared1"))
        .unwrap();
    assert_eq!(record.payload.get("title").and_then(|v| v.as_str()), Some("one"));
}

// ============================================================================
// Reading List
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Unable(SyncError),
    Stage(Stage),
    Complete,
}

#[derive(Default)]
struct SyncRecorder {
    events: Mutex<Vec<Event>>,
}

impl SyncRecorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn failure(&self) -> Option<SyncError> {
        self.events().into_iter().find_map(|event| match event {
            Event::Unable(error) => Some(error),
            _ => None,
        })
    }

    fn completed(&self) -> bool {
        self.events().contains(&Event::Complete)
    }
}

impl ReadingListSynchronizerDelegate for SyncRecorder {
    fn on_unable_to_sync(&self, error: SyncError) {
        self.events.lock().push(Event::Unable(error));
    }

    fn on_stage_complete(&self, stage: Stage) {
        self.events.lock().push(Event::Stage(stage));
    }

    fn on_complete(&self) {
        self.events.lock().push(Event::Complete);
    }
}

struct ReadingListFixture {
    server: Arc<SyncServer>,
    loopback: InMemoryServer,
    storage: Arc<MemoryReadingListStorage>,
    synchronizer: ReadingListSynchronizer,
}

impl ReadingListFixture {
    fn new(loopback: InMemoryServer) -> Self {
        Self::with_transport(loopback.transport(), loopback)
    }

    fn with_transport(transport: Transport, loopback: InMemoryServer) -> Self {
        let storage = Arc::new(MemoryReadingListStorage::new());
        let client = ReadingListClient::new(transport, &Url::parse(READING_LIST_URL).unwrap())
            .unwrap();
        let synchronizer = ReadingListSynchronizer::new(
            client,
            storage.clone(),
            Arc::new(NonPersistentRepositoryStateProvider::new()),
        )
        .unwrap();
        Self {
            server: Arc::clone(&loopback.server),
            loopback,
            storage,
            synchronizer,
        }
    }

    fn sync(&self) -> Arc<SyncRecorder> {
        let recorder = Arc::new(SyncRecorder::default());
        self.synchronizer.sync_blocking(recorder.clone()).unwrap();
        recorder
    }

    /// Creates an article on the server and mirrors it locally as synced.
    fn shared_article(&self, url: &str) -> (String, i64) {
        let created = self
            .server
            .articles()
            .create(serde_json::json!({"url": url, "title": url}))
            .unwrap();
        let record = created.record().clone();
        let guid = record.guid().unwrap().to_string();
        let id = self.storage.add_synced(record);
        (guid, id)
    }
}

fn reading_list() -> ReadingListFixture {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    ReadingListFixture::new(InMemoryServer::new(server))
}

#[test]
fn reading_list_uploads_deletions_before_new_items() {
    let fixture = reading_list();
    let (gone, id) = fixture.shared_article("https://gone.example");
    fixture.storage.delete_local(id);
    fixture.storage.add_local(
        FieldBag::new()
            .with("url", "https://new.example")
            .with("title", "New"),
    );

    let recorder = fixture.sync();
    assert!(recorder.completed());
    assert!(recorder.failure().is_none());

    let requests = fixture.loopback.requests();
    let delete = requests.iter().position(|(m, _)| *m == Method::Delete).unwrap();
    let post = requests.iter().position(|(m, _)| *m == Method::Post).unwrap();
    assert!(delete < post);
    assert!(requests[delete].1.ends_with(&gone));

    assert_eq!(fixture.server.articles().live_count(), 1);
    let rows = fixture.storage.all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].url(), Some("https://new.example"));
    assert!(rows[0].guid().is_some());
    assert_eq!(
        fixture.synchronizer.checkpoint(),
        Some(fixture.server.articles().last_modified())
    );
}

#[test]
fn reading_list_downloads_and_then_asks_for_changes_only() {
    let fixture = reading_list();
    for url in ["https://a.example", "https://b.example"] {
        fixture
            .server
            .articles()
            .create(serde_json::json!({"url": url, "title": url}))
            .unwrap();
    }

    let recorder = fixture.sync();
    assert!(recorder.completed());
    assert_eq!(fixture.storage.all().len(), 2);
    let checkpoint = fixture.synchronizer.checkpoint().unwrap();
    assert_eq!(checkpoint, fixture.server.articles().last_modified());

    let recorder = fixture.sync();
    assert!(recorder.failure().is_none());
    let last_get = fixture.loopback.gets().pop().unwrap();
    assert!(last_get.contains(&format!("_since={}", checkpoint)));
    assert_eq!(fixture.synchronizer.checkpoint(), Some(checkpoint));
    assert_eq!(fixture.storage.all().len(), 2);
}

#[test]
fn reading_list_deletion_rerun_after_crash_is_harmless() {
    let fixture = reading_list();
    let (guid, id) = fixture.shared_article("https://a.example");
    fixture.storage.delete_local(id);
    // The DELETE reached the server but the local row was never cleared.
    fixture.server.articles().delete(&guid).unwrap();

    let recorder = fixture.sync();
    assert!(recorder.completed());
    assert!(recorder.failure().is_none());
    assert!(fixture.storage.all().is_empty());

    let recorder = fixture.sync();
    assert!(recorder.failure().is_none());
    assert!(fixture.storage.all().is_empty());
}

#[test]
fn reading_list_status_change_reaches_server() {
    let fixture = reading_list();
    let (guid, id) = fixture.shared_article("https://a.example");
    fixture.storage.set_status(id, "unread", false);

    let recorder = fixture.sync();
    assert!(recorder.failure().is_none());
    let article = fixture.server.articles().get(&guid).unwrap();
    assert_eq!(article.fields.get_bool("unread"), Some(false));
    assert!(!fixture.storage.get(id).unwrap().is_unread());
}

#[test]
fn reading_list_status_conflict_stops_the_sync() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let loopback = InMemoryServer::new(server)
        .with_hook(|_, request, _| (request.method == Method::Patch).then(|| status(409)));
    let fixture = ReadingListFixture::new(loopback);
    let (guid, id) = fixture.shared_article("https://a.example");
    fixture.storage.set_status(id, "unread", false);

    let requests_before = fixture.loopback.requests().len();
    let recorder = fixture.sync();
    assert!(!recorder.completed());
    assert_eq!(
        recorder.events(),
        vec![
            Event::Stage(Stage::UploadDeletions),
            Event::Unable(SyncError::StageFailed {
                stage: "upload_unread_changes".into(),
                failures: 1,
            }),
        ]
    );
    let methods: Vec<Method> = fixture.loopback.requests()[requests_before..]
        .iter()
        .map(|(method, _)| *method)
        .collect();
    assert_eq!(methods, vec![Method::Patch]);

    // The unsent change waits for the next sync.
    assert!(!fixture.storage.by_guid(&guid).unwrap().is_unread());
    assert_eq!(
        fixture.server.articles().get(&guid).unwrap().fields.get_bool("unread"),
        Some(true)
    );
}

#[test]
fn reading_list_duplicate_new_item_adopts_server_copy() {
    let fixture = reading_list();
    let created = fixture
        .server
        .articles()
        .create(serde_json::json!({"url": "https://a.example", "title": "Theirs"}))
        .unwrap();
    let server_guid = created.record().guid().unwrap().to_string();
    fixture.storage.add_local(
        FieldBag::new()
            .with("url", "https://a.example")
            .with("title", "Mine"),
    );

    let recorder = fixture.sync();
    assert!(recorder.failure().is_none());
    let rows = fixture.storage.all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].guid(), Some(server_guid.as_str()));
    assert_eq!(rows[0].title(), Some("Theirs"));
    assert_eq!(fixture.server.articles().live_count(), 1);
}

#[test]
fn reading_list_requires_valid_credentials() {
    let server = Arc::new(SyncServer::new(
        ServerConfig::default().with_auth(b"secret".to_vec()),
    ));

    let anonymous = ReadingListFixture::new(InMemoryServer::new(Arc::clone(&server)));
    let recorder = anonymous.sync();
    assert!(!recorder.completed());
    assert!(recorder
        .events()
        .contains(&Event::Unable(SyncError::AuthenticationInvalid(401))));

    let token = server.create_token("alice").unwrap();
    let loopback = InMemoryServer::new(Arc::clone(&server));
    let transport = loopback
        .transport()
        .with_auth(Arc::new(BearerAuthHeaderProvider::new(token)));
    let authorized = ReadingListFixture::with_transport(transport, loopback);
    authorized
        .storage
        .add_local(FieldBag::new().with("url", "https://a.example"));
    let recorder = authorized.sync();
    assert!(recorder.completed());
    assert!(recorder.failure().is_none());
    assert_eq!(server.articles().live_count(), 1);
}
