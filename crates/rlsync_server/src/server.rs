//! Main reference server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::reading_list::ArticleStore;
use crate::storage::CollectionStore;
use rlsync_protocol::{HttpRequest, HttpResponse};
use std::sync::Arc;

/// The reference server.
///
/// Serves Sync storage collections (`…/storage/<collection>`), the
/// `info/collections` and `info/configuration` documents, and a Reading List
/// `articles` collection, all from memory. Requests and responses are plain
/// values, so the server can be driven in-process.
///
/// # Example
///
/// ```
/// use rlsync_protocol::HttpRequest;
/// use rlsync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// let response = server.handle(&HttpRequest::get(
///     "https://sync.example.com/1.5/42/storage/bookmarks?full=1",
/// ));
/// assert_eq!(response.status(), 200);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a new server.
    pub fn new(config: ServerConfig) -> Self {
        let context = Arc::new(HandlerContext::new(config));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Handles one request.
    pub fn handle(&self, request: &HttpRequest) -> HttpResponse {
        self.handler.handle(request)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Returns the Sync collections.
    pub fn collections(&self) -> &CollectionStore {
        &self.context.collections
    }

    /// Returns the Reading List articles.
    pub fn articles(&self) -> &ArticleStore {
        &self.context.articles
    }

    /// Returns the current server time (ms).
    pub fn now(&self) -> i64 {
        self.context.clock.now()
    }

    /// Issues a bearer token for `user`.
    pub fn create_token(&self, user: &str) -> ServerResult<String> {
        self.context
            .validator()
            .ok_or_else(|| ServerError::Internal("authentication is not enabled".into()))?
            .create_token(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlsync_protocol::{Method, Record};

    #[test]
    fn server_lifecycle() {
        let server = SyncServer::new(ServerConfig::default());
        assert_eq!(server.collections().count("bookmarks"), 0);
        assert_eq!(server.articles().live_count(), 0);
        assert!(server.now() > 0);
        assert!(server.create_token("alice").is_err());
    }

    #[test]
    fn seeded_records_are_served() {
        let server = SyncServer::new(ServerConfig::default());
        let modified = server
            .collections()
            .insert(&Record::new("bookmarks").with_guid("b1").with_field("title", "t"))
            .unwrap();

        let mut response = server.handle(
            &HttpRequest::get("https://sync.example.com/1.5/42/storage/bookmarks?full=1")
                .with_header("accept", "application/newlines"),
        );
        assert_eq!(response.last_modified(), Some(modified));
        let line = response.text().unwrap();
        let record = Record::from_wire_line("bookmarks", line.trim()).unwrap();
        assert_eq!(record.guid.as_deref(), Some("b1"));
        assert_eq!(record.last_modified, modified);
    }

    #[test]
    fn tokens_gate_requests() {
        let server = SyncServer::new(ServerConfig::default().with_auth(b"k".to_vec()));
        let token = server.create_token("alice").unwrap();
        let request = HttpRequest::with_json_body(
            Method::Post,
            "https://readinglist.example.com/v1/articles",
            br#"{"url": "https://a.example"}"#.to_vec(),
        );

        assert_eq!(server.handle(&request).status(), 401);
        let authorized = request.with_header("Authorization", format!("Bearer {}", token));
        assert_eq!(server.handle(&authorized).status(), 201);
        assert_eq!(server.articles().live_count(), 1);
    }
}
