//! # rlsync Engine
//!
//! Resumable, bidirectional record synchronization over HTTP.
//!
//! This crate provides:
//! - Repository sessions (unstarted → active → done | aborted) with ordered
//!   delegate and store queues
//! - Sync 1.1 (single request) and Sync 1.5 (paged, batched) collection
//!   protocols
//! - Resumable downloads and batch-committed uploads
//! - Local/remote record reconciliation with clock-skew correction
//! - Staged, atomically committed repository state (memory or file)
//! - Synced-version tracking for versioned local stores
//! - The five-stage Reading List synchronizer
//!
//! ## Architecture
//!
//! A sync moves records through [`RecordsChannel`]s: a source session
//! fetches, a sink session stores. Each session is a [`RepositorySession`]
//! over a [`SyncProtocol`] ([`Server11Protocol`], [`Server15Protocol`],
//! [`LocalProtocol`]). Fetch callbacks run on the session's delegate queue;
//! stores run on its store queue.
//!
//! ## Key Invariants
//!
//! - A resume point is saved only after the page it follows is stored
//! - Uploaded records are reported stored only after their batch commits
//! - A synced version only advances to a version that was acknowledged
//! - The session checkpoint moves only at `finish`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod channel;
mod config;
mod downloader;
mod error;
mod http;
mod local;
mod queue;
mod reconcile;
pub mod reading_list;
mod server11;
mod server15;
mod session;
mod state_provider;
mod transport;
mod uploader;
mod versioning;

pub use auth::{
    AuthHeaderProvider, BasicAuthHeaderProvider, BearerAuthHeaderProvider,
    BrowserIdAuthHeaderProvider,
};
pub use channel::{FlowSummary, RecordsChannel, RecordsChannelDelegate};
pub use config::{HttpConfig, Server15Config, UploadLimits};
pub use downloader::BatchingDownloader;
pub use error::{SyncError, SyncResult};
#[cfg(feature = "reqwest")]
pub use http::ReqwestClient;
pub use http::{
    HttpClient, LoopbackClient, LoopbackServer, PendingRequest, PendingRequests, RequestHandle,
};
pub use local::{LocalProtocol, LocalRecordStore, MemoryLocalStore};
pub use queue::SerialQueue;
pub use reconcile::{reconcile_records, Reconciliation};
pub use server11::{collection_url, Server11Protocol};
pub use server15::Server15Protocol;
pub use session::{
    FetchRecordsDelegate, FinishDelegate, RepositorySession, SessionContext, SessionState,
    StoreDelegate, StoreEvent, SyncProtocol,
};
pub use state_provider::{
    NonPersistentRepositoryStateProvider, PersistentRepositoryStateProvider,
    RepositoryStateProvider, StagedWrites, StateValue, BATCHING_KEYS, HIGH_WATER_MARK, OFFSET,
    OFFSET_ORDER, OFFSET_SINCE,
};
pub use transport::{BackoffHandler, MockHttpClient, MockResponse, SimpleBackoffHandler, Transport};
pub use uploader::BatchingUploader;
pub use versioning::VersioningDelegateHelper;

pub use rlsync_protocol as protocol;
