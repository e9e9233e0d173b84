//! Authorization header providers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Supplies the `Authorization` header for outgoing requests.
pub trait AuthHeaderProvider: Send + Sync {
    /// Returns the header value, or `None` to send the request unauthenticated.
    fn authorization_header(&self) -> Option<String>;
}

/// HTTP Basic credentials.
#[derive(Debug, Clone)]
pub struct BasicAuthHeaderProvider {
    header: String,
}

impl BasicAuthHeaderProvider {
    /// Encodes `username:password`.
    pub fn new(username: &str, password: &str) -> Self {
        let encoded = STANDARD.encode(format!("{}:{}", username, password));
        Self {
            header: format!("Basic {}", encoded),
        }
    }
}

impl AuthHeaderProvider for BasicAuthHeaderProvider {
    fn authorization_header(&self) -> Option<String> {
        Some(self.header.clone())
    }
}

/// OAuth-style bearer token.
#[derive(Debug, Clone)]
pub struct BearerAuthHeaderProvider {
    token: String,
}

impl BearerAuthHeaderProvider {
    /// Wraps a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl AuthHeaderProvider for BearerAuthHeaderProvider {
    fn authorization_header(&self) -> Option<String> {
        Some(format!("Bearer {}", self.token))
    }
}

/// BrowserID assertion, as accepted by Reading List servers.
#[derive(Debug, Clone)]
pub struct BrowserIdAuthHeaderProvider {
    assertion: String,
}

impl BrowserIdAuthHeaderProvider {
    /// Wraps an assertion.
    pub fn new(assertion: impl Into<String>) -> Self {
        Self {
            assertion: assertion.into(),
        }
    }
}

impl AuthHeaderProvider for BrowserIdAuthHeaderProvider {
    fn authorization_header(&self) -> Option<String> {
        Some(format!("BrowserID {}", self.assertion))
    }
}
