//! Fetch command: streams a collection from a Sync 1.5 server.

use super::{format_timestamp, transport, CliError, CliResult};
use rlsync_engine::protocol::Record;
use rlsync_engine::{
    FetchRecordsDelegate, NonPersistentRepositoryStateProvider, PersistentRepositoryStateProvider,
    RepositorySession, RepositoryStateProvider, Server15Config, Server15Protocol, SyncError,
};
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use tracing::info;
use url::Url;

/// Options for [`run`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Storage URL.
    pub storage_url: Url,
    /// Collection name.
    pub collection: String,
    /// Bearer token.
    pub token: Option<String>,
    /// `newer` bound in milliseconds.
    pub since: i64,
    /// Records per page.
    pub batch_size: u64,
    /// State file for resumable fetches.
    pub state: Option<PathBuf>,
    /// Output format (text, json).
    pub format: String,
}

enum FetchEvent {
    Record(Box<Record>),
    Completed(i64),
    Failed(SyncError),
}

/// Forwards fetch callbacks to the printing thread.
struct ForwardingDelegate {
    tx: Sender<FetchEvent>,
}

impl ForwardingDelegate {
    fn new() -> (Arc<Self>, Receiver<FetchEvent>) {
        let (tx, rx) = channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl FetchRecordsDelegate for ForwardingDelegate {
    fn on_record_fetched(&self, record: Record) {
        let _ = self.tx.send(FetchEvent::Record(Box::new(record)));
    }

    fn on_fetch_failed(&self, error: SyncError) {
        let _ = self.tx.send(FetchEvent::Failed(error));
    }

    fn on_fetch_completed(&self, end: i64) {
        let _ = self.tx.send(FetchEvent::Completed(end));
    }
}

/// Runs the fetch, printing records as they arrive.
pub fn run(options: &FetchOptions) -> CliResult<()> {
    let state: Arc<dyn RepositoryStateProvider> = match &options.state {
        Some(path) => Arc::new(PersistentRepositoryStateProvider::open(path)?),
        None => Arc::new(NonPersistentRepositoryStateProvider::new()),
    };
    let protocol = Server15Protocol::new(
        transport(options.token.as_deref())?,
        &options.storage_url,
        &options.collection,
        Server15Config::new(options.batch_size),
        state,
    )?;
    let session = RepositorySession::new(&format!("fetch-{}", options.collection), protocol)?;
    session.begin()?;

    let (delegate, rx) = ForwardingDelegate::new();
    session.fetch_since(options.since, delegate);

    let mut count = 0usize;
    loop {
        match rx.recv().map_err(|_| CliError::Interrupted)? {
            FetchEvent::Record(record) => {
                print_record(&record, &options.format)?;
                count += 1;
            }
            FetchEvent::Completed(end) => {
                info!(collection = %options.collection, count, end, "fetch complete");
                eprintln!(
                    "✓ {} records from {} (server time {})",
                    count,
                    options.collection,
                    format_timestamp(end)
                );
                return Ok(());
            }
            FetchEvent::Failed(error) => {
                session.abort();
                return Err(error.into());
            }
        }
    }
}

fn print_record(record: &Record, format: &str) -> CliResult<()> {
    match format {
        "json" => println!("{}", record.to_wire_json()?),
        _ => {
            let guid = record.guid.as_deref().unwrap_or("-");
            if record.deleted {
                println!("{}  {}  (deleted)", guid, record.modified_decimal_seconds());
            } else {
                println!(
                    "{}  {}  {}",
                    guid,
                    record.modified_decimal_seconds(),
                    serde_json::Value::Object(record.payload.clone())
                );
            }
        }
    }
    Ok(())
}
