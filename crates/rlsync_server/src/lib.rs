//! # rlsync Server
//!
//! In-memory reference server for the rlsync engine.
//!
//! This crate provides:
//! - Sync 1.5-style collection storage (`newer`, `limit`, `sort`, `offset`,
//!   `ids`), batched uploads with commit, and `X-If-Unmodified-Since`
//!   preconditions
//! - `info/collections` and `info/configuration` documents
//! - A Reading List `articles` collection with tombstones, conditional
//!   writes and conditional GETs
//! - Authentication (HMAC-SHA256 bearer tokens)
//!
//! # Authentication
//!
//! Authentication is optional:
//!
//! ```rust
//! use rlsync_server::{ServerConfig, SyncServer};
//!
//! let server = SyncServer::new(ServerConfig::default().with_auth(b"secret".to_vec()));
//! let token = server.create_token("alice").unwrap();
//! // Send `Authorization: Bearer <token>` with every request.
//! # assert!(!token.is_empty());
//! ```
//!
//! # Timestamps
//!
//! Server timestamps have a resolution of 10 ms so they survive the
//! two-decimal wire format. Every write is stamped strictly later than any
//! time the server has already reported.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod clock;
mod config;
mod error;
mod handler;
mod reading_list;
mod server;
mod storage;

pub use auth::{AuthConfig, TokenValidator};
pub use clock::ServerClock;
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use reading_list::{ArticleStore, Created, Listing};
pub use server::SyncServer;
pub use storage::{CollectionStore, Page, PostOutcome, StoredRecord};
