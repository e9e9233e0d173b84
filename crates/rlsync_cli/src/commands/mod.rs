//! CLI command implementations.

pub mod articles;
pub mod fetch;
pub mod state;

use chrono::DateTime;
use rlsync_engine::protocol::ProtocolError;
use rlsync_engine::{
    BearerAuthHeaderProvider, HttpConfig, ReqwestClient, SimpleBackoffHandler, SyncError,
    Transport,
};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the CLI.
#[derive(Error, Debug)]
pub enum CliError {
    /// The engine failed.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// A record could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// JSON output failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// No state file at the given path.
    #[error("no state file at {0}")]
    MissingState(PathBuf),

    /// The fetch stopped without reporting an outcome.
    #[error("fetch ended without a result")]
    Interrupted,
}

/// Result alias for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Builds a blocking HTTP transport, authenticated if a token is given.
pub fn transport(token: Option<&str>) -> CliResult<Transport> {
    let config = HttpConfig::new().with_user_agent(format!("rlsync-cli/{}", env!("CARGO_PKG_VERSION")));
    let mut transport = Transport::new(Arc::new(ReqwestClient::new(&config)?))
        .with_backoff(Arc::new(SimpleBackoffHandler::new()));
    if let Some(token) = token {
        transport = transport.with_auth(Arc::new(BearerAuthHeaderProvider::new(token)));
    }
    Ok(transport)
}

/// Renders milliseconds since the epoch as a UTC date.
pub fn format_timestamp(ms: i64) -> String {
    match DateTime::from_timestamp_millis(ms) {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string(),
        None => format!("{} ms since epoch", ms),
    }
}
