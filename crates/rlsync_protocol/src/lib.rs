//! # rlsync Protocol
//!
//! Wire types and formats shared by the rlsync engine and reference server.
//!
//! This crate provides:
//! - [`Record`] and the Sync 1.1 wire envelope (WBO) it travels in
//! - [`RepositorySessionBundle`] session checkpoints
//! - Collection query construction ([`CollectionQuery`], [`SortOrder`])
//! - Response header parsing (server timestamps, backoff, offsets)
//! - `info/collections`, `info/configuration` and POST result documents
//! - Reading List record types and the additive [`ReadingListQuery`] builder
//! - Plain HTTP request/response values ([`HttpRequest`], [`HttpResponse`])
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bundle;
mod error;
pub mod headers;
mod http;
mod info;
mod query;
mod reading_list;
mod record;
pub mod timestamp;

pub use bundle::RepositorySessionBundle;
pub use error::{ProtocolError, ProtocolResult};
pub use http::{HttpRequest, HttpResponse, Method};
pub use info::{InfoCollections, InfoConfiguration, PostResponse};
pub use query::{BatchParam, CollectionQuery, SortOrder};
pub use reading_list::{
    fields, ClientMetadata, ClientReadingListRecord, FieldBag, ReadingListQuery,
    ServerMetadata, ServerReadingListRecord,
};
pub use record::{Record, WireRecord};
