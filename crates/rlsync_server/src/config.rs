//! Server configuration.

use rlsync_protocol::InfoConfiguration;

/// Configuration for the reference server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upload limits, also served as `info/configuration`.
    pub limits: InfoConfiguration,
    /// Largest page a collection GET returns, whatever `limit` asks for.
    pub max_page_size: u64,
    /// Whether batched uploads (`batch=`) are honoured.
    pub batch_uploads: bool,
    /// Whether to require authentication.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
}

impl ServerConfig {
    /// Creates a configuration with the default Sync 1.5 limits.
    pub fn new() -> Self {
        Self {
            limits: InfoConfiguration::default(),
            max_page_size: 1000,
            batch_uploads: true,
            require_auth: false,
            auth_secret: None,
        }
    }

    /// Sets the upload limits.
    pub fn with_limits(mut self, limits: InfoConfiguration) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the largest page returned by a collection GET.
    pub fn with_max_page_size(mut self, size: u64) -> Self {
        self.max_page_size = size.max(1);
        self
    }

    /// Disables batch uploads; every POST is applied on its own, as a
    /// Sync 1.1 server would.
    pub fn without_batch_uploads(mut self) -> Self {
        self.batch_uploads = false;
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
