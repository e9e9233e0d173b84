//! Request dispatch shared by every repository and the Reading List client.

use crate::auth::AuthHeaderProvider;
use crate::error::{SyncError, SyncResult};
use crate::http::HttpClient;
use parking_lot::Mutex;
use rlsync_protocol::headers::AUTHORIZATION;
use rlsync_protocol::timestamp::now_millis;
use rlsync_protocol::{HttpRequest, HttpResponse};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives server backoff requests.
///
/// Backoff is advisory: the engine records it and keeps going; schedulers
/// consult the handler before starting the next sync.
pub trait BackoffHandler: Send + Sync {
    /// Asks that no request be made before `millis` (wall clock).
    fn set_earliest_next_request(&self, millis: i64);
}

/// Remembers the latest "do not sync before" time it was given.
#[derive(Debug, Default)]
pub struct SimpleBackoffHandler {
    earliest: AtomicI64,
}

impl SimpleBackoffHandler {
    /// Creates a handler with no backoff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the earliest time the next request may be made.
    pub fn earliest_next_request(&self) -> i64 {
        self.earliest.load(Ordering::SeqCst)
    }

    /// Returns true if `now` is still inside a backoff window.
    pub fn should_back_off(&self, now: i64) -> bool {
        now < self.earliest_next_request()
    }
}

impl BackoffHandler for SimpleBackoffHandler {
    fn set_earliest_next_request(&self, millis: i64) {
        self.earliest.fetch_max(millis, Ordering::SeqCst);
    }
}

/// An HTTP client plus the credentials and backoff bookkeeping around it.
#[derive(Clone)]
pub struct Transport {
    client: Arc<dyn HttpClient>,
    auth: Option<Arc<dyn AuthHeaderProvider>>,
    backoff: Option<Arc<dyn BackoffHandler>>,
}

impl Transport {
    /// Wraps a client with no credentials.
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self {
            client,
            auth: None,
            backoff: None,
        }
    }

    /// Sets the credentials provider.
    pub fn with_auth(mut self, auth: Arc<dyn AuthHeaderProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Sets the backoff handler.
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffHandler>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Sends a request, returning whatever status the server answered with.
    pub fn send(&self, mut request: HttpRequest) -> SyncResult<HttpResponse> {
        if request.header(AUTHORIZATION).is_none() {
            if let Some(header) = self.auth.as_ref().and_then(|a| a.authorization_header()) {
                request = request.with_header(AUTHORIZATION, header);
            }
        }

        debug!(method = %request.method, url = %request.url, "sending request");
        let response = self.client.execute(request)?;
        debug!(status = response.status(), "received response");

        if let Some(seconds) = response.backoff_seconds() {
            warn!(seconds, status = response.status(), "server requested backoff");
            if let Some(handler) = &self.backoff {
                let delay = i64::try_from(seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
                handler.set_earliest_next_request(now_millis().saturating_add(delay));
            }
        }
        Ok(response)
    }

    /// Sends a request and turns any non-2xx status into an error.
    pub fn send_checked(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let mut response = self.send(request)?;
        if response.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(SyncError::from_status(response.status(), body))
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("authenticated", &self.auth.is_some())
            .field("backoff", &self.backoff.is_some())
            .finish()
    }
}

/// A canned response for [`MockHttpClient`].
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl MockResponse {
    /// Creates an empty response with a status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    fn into_response(self) -> HttpResponse {
        HttpResponse::from_bytes(self.status, self.headers, self.body)
    }
}

/// A scripted client for testing.
///
/// Responses are returned in the order they were queued. Every request is
/// recorded.
#[derive(Debug, Default)]
pub struct MockHttpClient {
    responses: Mutex<VecDeque<SyncResult<MockResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    /// Creates a client with nothing queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_response(&self, response: MockResponse) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues a transport failure.
    pub fn push_error(&self, error: SyncError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Returns the number of responses still queued.
    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

impl HttpClient for MockHttpClient {
    fn execute(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let url = request.url.clone();
        self.requests.lock().push(request);
        match self.responses.lock().pop_front() {
            Some(Ok(response)) => Ok(response.into_response()),
            Some(Err(error)) => Err(error),
            None => Err(SyncError::Protocol(format!("no mock response for {}", url))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::BearerAuthHeaderProvider;

    #[test]
    fn adds_authorization() {
        let client = Arc::new(MockHttpClient::new());
        client.push_response(MockResponse::new(200));
        let transport = Transport::new(client.clone())
            .with_auth(Arc::new(BearerAuthHeaderProvider::new("t")));

        transport.send(HttpRequest::get("https://x/")).unwrap();
        assert_eq!(client.requests()[0].header("Authorization"), Some("Bearer t"));
    }

    #[test]
    fn records_backoff() {
        let client = Arc::new(MockHttpClient::new());
        client.push_response(MockResponse::new(503).with_header("Retry-After", "60"));
        let backoff = Arc::new(SimpleBackoffHandler::new());
        let transport = Transport::new(client).with_backoff(backoff.clone());

        let before = now_millis();
        let response = transport.send(HttpRequest::get("https://x/")).unwrap();
        assert_eq!(response.status(), 503);
        assert!(backoff.earliest_next_request() >= before + 60_000);
        assert!(backoff.should_back_off(before));
    }

    #[test]
    fn send_checked_maps_status() {
        let client = Arc::new(MockHttpClient::new());
        client.push_response(MockResponse::new(401));
        client.push_response(MockResponse::new(500).with_body("oops"));
        let transport = Transport::new(client);

        let err = transport.send_checked(HttpRequest::get("https://x/")).unwrap_err();
        assert_eq!(err, SyncError::AuthenticationInvalid(401));

        let err = transport.send_checked(HttpRequest::get("https://x/")).unwrap_err();
        assert_eq!(
            err,
            SyncError::Http {
                status: 500,
                message: "oops".into()
            }
        );
    }

    #[test]
    fn exhausted_mock_errors() {
        let transport = Transport::new(Arc::new(MockHttpClient::new()));
        assert!(transport.send(HttpRequest::get("https://x/")).is_err());
    }
}
