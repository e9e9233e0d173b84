//! HTTP client abstraction.
//!
//! The engine issues blocking requests through [`HttpClient`]. Implementations
//! are provided for `reqwest` (behind the `reqwest` feature) and for an
//! in-process server ([`LoopbackClient`]).

use crate::error::SyncResult;
use parking_lot::Mutex;
use rlsync_protocol::{HttpRequest, HttpResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. Responses must
/// be returned as soon as headers are available; the body is read
/// incrementally by the caller.
pub trait HttpClient: Send + Sync {
    /// Executes a request.
    ///
    /// Non-success statuses are returned as responses, not errors. Errors are
    /// reserved for failures to obtain a response at all.
    fn execute(&self, request: HttpRequest) -> SyncResult<HttpResponse>;
}

impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    fn execute(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        (**self).execute(request)
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a request and returns the response.
    fn handle(&self, request: &HttpRequest) -> HttpResponse;
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    fn execute(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        Ok(self.server.handle(&request))
    }
}

/// An abort flag for one in-flight request.
#[derive(Debug, Clone, Default)]
pub struct RequestHandle {
    aborted: Arc<AtomicBool>,
}

impl RequestHandle {
    /// Returns true once the request has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Marks the request aborted.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// The set of requests a session currently has in flight.
#[derive(Debug, Default)]
pub struct PendingRequests {
    next_id: AtomicU64,
    handles: Mutex<HashMap<u64, RequestHandle>>,
    closed: AtomicBool,
}

impl PendingRequests {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new request. The returned guard deregisters it on drop.
    ///
    /// After [`abort_all`](Self::abort_all) every new registration starts out
    /// aborted.
    pub fn register(self: &Arc<Self>) -> PendingRequest {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = RequestHandle::default();
        if self.closed.load(Ordering::SeqCst) {
            handle.abort();
        }
        self.handles.lock().insert(id, handle.clone());
        PendingRequest {
            id,
            handle,
            owner: Arc::clone(self),
        }
    }

    /// Aborts every registered request and all future ones.
    pub fn abort_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let handles = self.handles.lock();
        for handle in handles.values() {
            handle.abort();
        }
        handles.len()
    }

    /// Returns the number of requests in flight.
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Returns true if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration of one in-flight request.
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    handle: RequestHandle,
    owner: Arc<PendingRequests>,
}

impl PendingRequest {
    /// Returns true once the request has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.handle.is_aborted()
    }

    /// Returns a clone of the abort handle.
    pub fn handle(&self) -> RequestHandle {
        self.handle.clone()
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.owner.handles.lock().remove(&self.id);
    }
}

#[cfg(feature = "reqwest")]
pub use self::reqwest_client::ReqwestClient;

#[cfg(feature = "reqwest")]
mod reqwest_client {
    use super::HttpClient;
    use crate::config::HttpConfig;
    use crate::error::{SyncError, SyncResult};
    use rlsync_protocol::{HttpRequest, HttpResponse, Method};

    /// Blocking HTTP client backed by `reqwest`.
    pub struct ReqwestClient {
        client: reqwest::blocking::Client,
    }

    impl ReqwestClient {
        /// Builds a client from the configuration.
        pub fn new(config: &HttpConfig) -> SyncResult<Self> {
            let client = reqwest::blocking::Client::builder()
                .connect_timeout(config.connect_timeout)
                .timeout(config.read_timeout)
                .user_agent(config.user_agent.clone())
                .build()
                .map_err(|e| SyncError::transport_fatal(format!("http client: {}", e)))?;
            Ok(Self { client })
        }
    }

    fn method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }

    impl HttpClient for ReqwestClient {
        fn execute(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
            let mut builder = self.client.request(method(request.method), &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().map_err(|e| SyncError::Transport {
                retryable: e.is_timeout() || e.is_connect() || e.is_request(),
                message: e.to_string(),
            })?;

            let status = response.status().as_u16();
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            Ok(HttpResponse::new(status, headers, Box::new(response)))
        }
    }
}
