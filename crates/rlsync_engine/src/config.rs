//! Configuration for the sync engine.

use rlsync_protocol::SortOrder;
use std::time::Duration;

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Time allowed to establish a connection.
    pub connect_timeout: Duration,
    /// Time allowed between reads of a response.
    pub read_timeout: Duration,
    /// User-Agent header value.
    pub user_agent: String,
}

impl HttpConfig {
    /// Creates a configuration with default timeouts.
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(300),
            user_agent: format!("rlsync/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the User-Agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a batching (Sync 1.5) repository.
#[derive(Debug, Clone)]
pub struct Server15Config {
    /// Records per download page; `None` fetches everything in one response.
    pub batch_size: Option<u64>,
    /// Whether a fetch may span several pages.
    pub allow_multiple_batches: bool,
    /// Whether the high-water-mark is tracked and consulted.
    pub allow_high_water_mark: bool,
    /// Server-side fetch order.
    pub sort_order: SortOrder,
}

impl Server15Config {
    /// Creates a configuration fetching oldest-first in pages of `batch_size`.
    pub fn new(batch_size: u64) -> Self {
        Self {
            batch_size: Some(batch_size),
            allow_multiple_batches: true,
            allow_high_water_mark: false,
            sort_order: SortOrder::Oldest,
        }
    }

    /// Sets or clears the page size.
    pub fn with_batch_size(mut self, batch_size: Option<u64>) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Allows or forbids multi-page fetches.
    pub fn with_multiple_batches(mut self, allow: bool) -> Self {
        self.allow_multiple_batches = allow;
        self
    }

    /// Enables or disables high-water-mark tracking.
    pub fn with_high_water_mark(mut self, allow: bool) -> Self {
        self.allow_high_water_mark = allow;
        self
    }

    /// Sets the sort order.
    pub fn with_sort_order(mut self, sort_order: SortOrder) -> Self {
        self.sort_order = sort_order;
        self
    }

    /// Returns true if the high-water-mark applies to fetches.
    pub fn uses_high_water_mark(&self) -> bool {
        self.allow_high_water_mark && self.sort_order == SortOrder::Oldest
    }
}

impl Default for Server15Config {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Chunking limits for the simple (Sync 1.1) uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    /// Most records per POST.
    pub max_records: usize,
    /// Largest POST body in bytes.
    pub max_bytes: usize,
}

impl UploadLimits {
    /// Creates limits.
    pub fn new(max_records: usize, max_bytes: usize) -> Self {
        Self {
            max_records,
            max_bytes,
        }
    }

    /// Sets the record limit.
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }

    /// Sets the byte limit.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self::new(50, 1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_config_builder() {
        let config = HttpConfig::new()
            .with_connect_timeout(Duration::from_secs(5))
            .with_read_timeout(Duration::from_secs(60))
            .with_user_agent("test/1.0");

        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.user_agent, "test/1.0");
    }

    #[test]
    fn high_water_mark_needs_oldest_first() {
        let config = Server15Config::new(10).with_high_water_mark(true);
        assert!(config.uses_high_water_mark());

        let config = config.with_sort_order(SortOrder::Newest);
        assert!(!config.uses_high_water_mark());

        let config = Server15Config::new(10);
        assert!(!config.uses_high_water_mark());
    }

    #[test]
    fn upload_limit_defaults() {
        let limits = UploadLimits::default();
        assert_eq!(limits.max_records, 50);
        assert_eq!(limits.max_bytes, 1024 * 1024);
        assert_eq!(limits.with_max_records(3).max_records, 3);
    }
}
