//! Repository sessions.
//!
//! A session is one pass over a repository: `begin`, any number of fetches
//! and stores, then `finish` (or `abort`). The repository-specific work is
//! supplied by a [`SyncProtocol`]; the session owns the lifecycle, the two
//! serial queues and the bookkeeping every protocol shares.

use crate::error::{SyncError, SyncResult};
use crate::http::{PendingRequest, PendingRequests};
use crate::queue::SerialQueue;
use parking_lot::Mutex;
use rlsync_protocol::timestamp::now_millis;
use rlsync_protocol::{HttpResponse, Record, RepositorySessionBundle};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, `begin` not yet called.
    Unstarted,
    /// Fetches and stores are allowed.
    Active,
    /// Finished successfully.
    Done,
    /// Aborted; queued work was dropped.
    Aborted,
}

impl SessionState {
    /// Returns true if moving from `self` to `to` is allowed.
    ///
    /// Aborting is allowed from anywhere.
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        matches!(
            (self, to),
            (SessionState::Unstarted, SessionState::Active)
                | (SessionState::Active, SessionState::Done)
                | (_, SessionState::Aborted)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Receives fetched records.
///
/// All callbacks run on the session's delegate queue, in server order.
pub trait FetchRecordsDelegate: Send + Sync {
    /// Called once per record.
    fn on_record_fetched(&self, record: Record);

    /// Called after each page of a paged fetch, before the next page is
    /// requested. Work done here is complete before resume state is saved.
    fn on_batch_completed(&self) {}

    /// Called once if the fetch fails.
    fn on_fetch_failed(&self, error: SyncError);

    /// Called once when every record has been delivered.
    fn on_fetch_completed(&self, end: i64);
}

/// Receives store outcomes.
pub trait StoreDelegate: Send + Sync {
    /// A record was stored as-is.
    fn on_record_store_succeeded(&self, guid: &str);

    /// A record was stored after reconciliation or deduplication.
    ///
    /// `old_guid` is the guid the record replaced, if it was re-targeted.
    /// `local_version` is the local version the write produced.
    fn on_record_store_reconciled(
        &self,
        guid: &str,
        old_guid: Option<&str>,
        local_version: Option<i64>,
    ) {
        let _ = (guid, old_guid, local_version);
    }

    /// A single record could not be stored.
    fn on_record_store_failed(&self, error: SyncError, guid: Option<&str>);

    /// Every stored record has been handled.
    fn on_store_completed(&self, end: i64);

    /// The store as a whole failed.
    fn on_store_failed(&self, error: SyncError);
}

/// Receives the outcome of `finish`.
pub trait FinishDelegate: Send + Sync {
    /// The session finished; `bundle` is the checkpoint to persist.
    fn on_finish_succeeded(&self, bundle: RepositorySessionBundle);

    /// The session could not finish.
    fn on_finish_failed(&self, error: SyncError);
}

/// A per-record store outcome, buffered until `store_done`.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Stored unchanged.
    Succeeded(String),
    /// Stored after reconciliation.
    Reconciled {
        /// Guid now held by the record.
        guid: String,
        /// Guid it replaced.
        old_guid: Option<String>,
        /// Local version produced by the write.
        local_version: Option<i64>,
    },
    /// Not stored.
    Failed {
        /// Record guid, if it had one.
        guid: Option<String>,
        /// Cause.
        error: SyncError,
    },
}

impl StoreEvent {
    fn dispatch(self, delegate: &dyn StoreDelegate) {
        match self {
            StoreEvent::Succeeded(guid) => delegate.on_record_store_succeeded(&guid),
            StoreEvent::Reconciled {
                guid,
                old_guid,
                local_version,
            } => delegate.on_record_store_reconciled(&guid, old_guid.as_deref(), local_version),
            StoreEvent::Failed { guid, error } => {
                delegate.on_record_store_failed(error, guid.as_deref())
            }
        }
    }
}

/// Repository-specific session behaviour.
///
/// Fetch methods run on the caller's thread and deliver records through
/// [`SessionContext::deliver`]. `store` and `store_done` run on the store
/// queue, in order.
pub trait SyncProtocol: Send + Sync + 'static {
    /// Called by `begin` before the session becomes active.
    fn begin(&self, ctx: &SessionContext) -> SyncResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// The timestamp fetches should start from.
    fn last_sync_timestamp(&self, ctx: &SessionContext) -> i64 {
        ctx.last_sync()
    }

    /// Returns false only if nothing can have changed since the last sync.
    fn data_available(&self, ctx: &SessionContext) -> SyncResult<bool> {
        let _ = ctx;
        Ok(true)
    }

    /// Fetches records changed after `since`, returning the fetch end.
    fn fetch_since(
        &self,
        ctx: &SessionContext,
        since: i64,
        delegate: &Arc<dyn FetchRecordsDelegate>,
    ) -> SyncResult<i64>;

    /// Fetches specific records, returning the fetch end.
    fn fetch(
        &self,
        ctx: &SessionContext,
        guids: &[String],
        delegate: &Arc<dyn FetchRecordsDelegate>,
    ) -> SyncResult<i64>;

    /// Fetches every record.
    fn fetch_all(
        &self,
        ctx: &SessionContext,
        delegate: &Arc<dyn FetchRecordsDelegate>,
    ) -> SyncResult<i64> {
        self.fetch_since(ctx, 0, delegate)
    }

    /// Stores (or buffers) one record. Outcomes go through
    /// [`SessionContext::report_store`].
    fn store(&self, ctx: &SessionContext, record: Record) -> SyncResult<()>;

    /// Flushes buffered stores. Returns a server end timestamp if one is known.
    fn store_done(&self, ctx: &SessionContext) -> SyncResult<Option<i64>>;

    /// Drops buffered work after an abort.
    fn abort(&self, ctx: &SessionContext) {
        let _ = ctx;
    }
}

/// State shared between a session and its protocol.
pub struct SessionContext {
    name: String,
    state: Mutex<SessionState>,
    delegate_queue: SerialQueue,
    store_queue: SerialQueue,
    pending: Arc<PendingRequests>,
    last_sync: AtomicI64,
    pending_end: AtomicI64,
    clock_skew: AtomicI64,
    tracked: Mutex<HashSet<String>>,
    store_events: Mutex<Vec<StoreEvent>>,
}

impl SessionContext {
    fn new(name: &str) -> SyncResult<Self> {
        Ok(Self {
            name: name.to_string(),
            state: Mutex::new(SessionState::Unstarted),
            delegate_queue: SerialQueue::new(format!("{}-delegate", name))?,
            store_queue: SerialQueue::new(format!("{}-store", name))?,
            pending: Arc::new(PendingRequests::new()),
            last_sync: AtomicI64::new(0),
            pending_end: AtomicI64::new(0),
            clock_skew: AtomicI64::new(0),
            tracked: Mutex::new(HashSet::new()),
            store_events: Mutex::new(Vec::new()),
        })
    }

    /// Returns the session name used in logs and thread names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Returns true while fetches and stores are allowed.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Returns true once the session was aborted.
    pub fn is_aborted(&self) -> bool {
        self.state() == SessionState::Aborted
    }

    fn transition(&self, to: SessionState) -> SyncResult<SessionState> {
        let mut state = self.state.lock();
        if !state.can_transition_to(to) {
            return Err(SyncError::InvalidSessionTransition {
                from: state.to_string(),
                to: to.to_string(),
            });
        }
        let from = *state;
        *state = to;
        debug!(session = %self.name, %from, %to, "session transition");
        Ok(from)
    }

    /// Returns the checkpoint loaded by `unbundle`.
    pub fn last_sync(&self) -> i64 {
        self.last_sync.load(Ordering::SeqCst)
    }

    /// Folds a fetch or store end timestamp into the next checkpoint.
    pub fn note_end(&self, end: i64) {
        self.pending_end.fetch_max(end, Ordering::SeqCst);
    }

    /// Milliseconds to add to a server timestamp to place it on the local
    /// clock.
    pub fn clock_skew(&self) -> i64 {
        self.clock_skew.load(Ordering::SeqCst)
    }

    /// Updates the clock skew from a response's `X-Weave-Timestamp`.
    pub fn observe_response(&self, response: &HttpResponse) {
        if let Some(server_now) = response.weave_timestamp() {
            self.clock_skew
                .store(now_millis() - server_now, Ordering::SeqCst);
        }
    }

    /// The current time on the server's clock, as far as we know it.
    pub fn server_now(&self) -> i64 {
        now_millis() - self.clock_skew()
    }

    /// Returns true if `guid` was stored in this session.
    pub fn is_tracked(&self, guid: &str) -> bool {
        self.tracked.lock().contains(guid)
    }

    /// Marks `guid` as stored in this session, so fetches skip it.
    pub fn track_guid(&self, guid: impl Into<String>) {
        self.tracked.lock().insert(guid.into());
    }

    /// Registers an in-flight request; abort marks it.
    pub fn register_request(&self) -> PendingRequest {
        self.pending.register()
    }

    /// Runs `callback` on the delegate queue. Returns false once shut down.
    pub fn deliver<F>(&self, callback: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.delegate_queue.submit(callback)
    }

    /// Runs `callback` on the delegate queue and waits for it.
    pub fn deliver_and_wait<F>(&self, callback: F) -> SyncResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.delegate_queue
            .submit_and_wait(callback)
            .ok_or(SyncError::Cancelled)
    }

    /// Records a store outcome, reported at `store_done`.
    pub fn report_store(&self, event: StoreEvent) {
        self.store_events.lock().push(event);
    }

    fn take_store_events(&self) -> Vec<StoreEvent> {
        std::mem::take(&mut *self.store_events.lock())
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("last_sync", &self.last_sync())
            .finish_non_exhaustive()
    }
}

/// A session over one repository.
pub struct RepositorySession<P: SyncProtocol> {
    protocol: Arc<P>,
    ctx: Arc<SessionContext>,
}

impl<P: SyncProtocol> RepositorySession<P> {
    /// Creates an unstarted session. Starts the delegate and store queues.
    pub fn new(name: &str, protocol: P) -> SyncResult<Self> {
        Ok(Self {
            protocol: Arc::new(protocol),
            ctx: Arc::new(SessionContext::new(name)?),
        })
    }

    /// Returns the protocol.
    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    /// Returns the shared context.
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.ctx.state()
    }

    /// Moves `Unstarted -> Active`.
    pub fn begin(&self) -> SyncResult<()> {
        let current = self.ctx.state();
        if !current.can_transition_to(SessionState::Active) {
            return Err(SyncError::InvalidSessionTransition {
                from: current.to_string(),
                to: SessionState::Active.to_string(),
            });
        }
        self.protocol.begin(&self.ctx)?;
        self.ctx.transition(SessionState::Active)?;
        info!(session = %self.ctx.name, last_sync = self.ctx.last_sync(), "session started");
        Ok(())
    }

    /// Loads the checkpoint from a previous session.
    pub fn unbundle(&self, bundle: &RepositorySessionBundle) {
        self.ctx.last_sync.store(bundle.timestamp, Ordering::SeqCst);
    }

    /// The timestamp fetches should start from.
    pub fn last_sync_timestamp(&self) -> i64 {
        self.protocol.last_sync_timestamp(&self.ctx)
    }

    /// Returns false only if nothing can have changed since the last sync.
    pub fn data_available(&self) -> SyncResult<bool> {
        self.protocol.data_available(&self.ctx)
    }

    /// Returns true if `guid` was stored in this session.
    pub fn is_tracked(&self, guid: &str) -> bool {
        self.ctx.is_tracked(guid)
    }

    /// Marks `guid` as stored in this session.
    pub fn track_guid(&self, guid: impl Into<String>) {
        self.ctx.track_guid(guid)
    }

    fn run_fetch<F>(&self, delegate: Arc<dyn FetchRecordsDelegate>, fetch: F)
    where
        F: FnOnce(&Arc<dyn FetchRecordsDelegate>) -> SyncResult<i64>,
    {
        let result = if self.ctx.is_active() {
            fetch(&delegate)
        } else {
            Err(SyncError::InactiveSession(self.ctx.state().to_string()))
        };
        match result {
            Ok(end) => {
                self.ctx.note_end(end);
                self.ctx.deliver(move || delegate.on_fetch_completed(end));
            }
            Err(error) => {
                warn!(session = %self.ctx.name, %error, "fetch failed");
                self.ctx.deliver(move || delegate.on_fetch_failed(error));
            }
        }
    }

    /// Fetches records changed after `since`. Blocks until the last record
    /// has been handed to the delegate queue.
    pub fn fetch_since(&self, since: i64, delegate: Arc<dyn FetchRecordsDelegate>) {
        self.run_fetch(delegate, |d| self.protocol.fetch_since(&self.ctx, since, d));
    }

    /// Fetches specific records.
    pub fn fetch(&self, guids: &[String], delegate: Arc<dyn FetchRecordsDelegate>) {
        self.run_fetch(delegate, |d| self.protocol.fetch(&self.ctx, guids, d));
    }

    /// Fetches every record.
    pub fn fetch_all(&self, delegate: Arc<dyn FetchRecordsDelegate>) {
        self.run_fetch(delegate, |d| self.protocol.fetch_all(&self.ctx, d));
    }

    /// Queues a record for storing.
    pub fn store(&self, record: Record) -> SyncResult<()> {
        if !self.ctx.is_active() {
            return Err(SyncError::InactiveSession(self.ctx.state().to_string()));
        }
        let protocol = Arc::clone(&self.protocol);
        let ctx = Arc::clone(&self.ctx);
        let queued = self.ctx.store_queue.submit(move || {
            let guid = record.guid.clone();
            if let Err(error) = protocol.store(&ctx, record) {
                ctx.report_store(StoreEvent::Failed { guid, error });
            }
        });
        if queued {
            Ok(())
        } else {
            Err(SyncError::Cancelled)
        }
    }

    /// Signals that no more records will be stored.
    ///
    /// Outcomes are delivered in order, then `on_store_completed` with the
    /// server's timestamp (or the current server time if none is known).
    pub fn store_done(&self, delegate: Arc<dyn StoreDelegate>) {
        self.enqueue_store_done(None, delegate);
    }

    /// Like [`store_done`](Self::store_done), completing at `end`.
    pub fn store_done_at(&self, end: i64, delegate: Arc<dyn StoreDelegate>) {
        self.enqueue_store_done(Some(end), delegate);
    }

    fn enqueue_store_done(&self, end: Option<i64>, delegate: Arc<dyn StoreDelegate>) {
        let protocol = Arc::clone(&self.protocol);
        let ctx = Arc::clone(&self.ctx);
        self.ctx.store_queue.submit(move || {
            let result = protocol
                .store_done(&ctx)
                .map(|server_end| end.or(server_end).unwrap_or_else(|| ctx.server_now()));
            let events = ctx.take_store_events();
            if let Ok(end) = &result {
                ctx.note_end(*end);
            }
            ctx.deliver(move || {
                for event in events {
                    event.dispatch(delegate.as_ref());
                }
                match result {
                    Ok(end) => delegate.on_store_completed(end),
                    Err(error) => delegate.on_store_failed(error),
                }
            });
        });
    }

    /// Blocks until every store queued so far has been applied.
    pub fn wait_for_stores(&self) -> SyncResult<()> {
        self.ctx
            .store_queue
            .submit_and_wait(|| ())
            .ok_or(SyncError::Cancelled)
    }

    /// Moves `Active -> Done`, then reports the new checkpoint.
    ///
    /// Outstanding stores complete first. Both queues are drained and shut
    /// down.
    pub fn finish(&self, delegate: Arc<dyn FinishDelegate>) -> SyncResult<()> {
        self.ctx.transition(SessionState::Done)?;

        let ctx = Arc::clone(&self.ctx);
        self.ctx.store_queue.submit(move || {
            let mut bundle = RepositorySessionBundle::new(ctx.last_sync());
            bundle.bump_timestamp(ctx.pending_end.load(Ordering::SeqCst));
            info!(session = %ctx.name, timestamp = bundle.timestamp, "session finished");
            ctx.deliver(move || delegate.on_finish_succeeded(bundle));
        });
        self.ctx.store_queue.shutdown();
        self.ctx.delegate_queue.shutdown();
        Ok(())
    }

    /// Aborts the session from any state.
    ///
    /// In-flight requests are marked aborted and queued work is dropped. The
    /// finish delegate is never called. Calling this again does nothing.
    pub fn abort(&self) {
        {
            let mut state = self.ctx.state.lock();
            if *state == SessionState::Aborted {
                return;
            }
            *state = SessionState::Aborted;
        }
        let aborted = self.ctx.pending.abort_all();
        self.protocol.abort(&self.ctx);
        self.ctx.store_queue.shutdown_now();
        self.ctx.delegate_queue.shutdown_now();
        info!(session = %self.ctx.name, aborted_requests = aborted, "session aborted");
    }
}

impl<P: SyncProtocol> fmt::Debug for RepositorySession<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositorySession")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}
