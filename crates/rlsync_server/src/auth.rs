//! Bearer-token authentication.
//!
//! Tokens are HMAC-SHA256 signed and carry the user they were issued to and
//! the time they were issued.
//!
//! ## Token Format
//!
//! `<claims>.<signature>`, both base64url without padding, where claims are:
//! - 8 bytes: issue timestamp (Unix millis, big-endian)
//! - the rest: user id, UTF-8
//!
//! The signature covers the raw claim bytes.

use crate::error::{ServerError, ServerResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rlsync_protocol::timestamp::now_millis;
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and validates bearer tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    fn mac(&self) -> ServerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("hmac key: {}", e)))
    }

    /// Creates a token for `user`, issued now.
    pub fn create_token(&self, user: &str) -> ServerResult<String> {
        self.create_token_at(user, now_millis())
    }

    fn create_token_at(&self, user: &str, issued_at: i64) -> ServerResult<String> {
        let mut claims = Vec::with_capacity(8 + user.len());
        claims.extend_from_slice(&issued_at.to_be_bytes());
        claims.extend_from_slice(user.as_bytes());

        let mut mac = self.mac()?;
        mac.update(&claims);
        let signature = mac.finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&claims),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Validates a token, returning the user it was issued to.
    pub fn validate_token(&self, token: &str) -> ServerResult<String> {
        let (claims, signature) = token
            .split_once('.')
            .ok_or_else(|| ServerError::AuthenticationFailed("malformed token".into()))?;
        let claims = URL_SAFE_NO_PAD
            .decode(claims)
            .map_err(|_| ServerError::AuthenticationFailed("malformed token".into()))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| ServerError::AuthenticationFailed("malformed token".into()))?;
        if claims.len() < 8 {
            return Err(ServerError::AuthenticationFailed("malformed token".into()));
        }

        let mut mac = self.mac()?;
        mac.update(&claims);
        mac.verify_slice(&signature)
            .map_err(|_| ServerError::AuthenticationFailed("invalid signature".into()))?;

        let (issued, user) = claims.split_at(8);
        let mut issued_bytes = [0u8; 8];
        issued_bytes.copy_from_slice(issued);
        let issued_at = i64::from_be_bytes(issued_bytes);
        let expiry = self.config.token_expiry.as_millis() as i64;
        if now_millis() > issued_at.saturating_add(expiry) {
            return Err(ServerError::AuthenticationFailed("token expired".into()));
        }

        String::from_utf8(user.to_vec())
            .map_err(|_| ServerError::AuthenticationFailed("malformed token".into()))
    }

    /// Validates an `Authorization` header value of the form `Bearer <token>`.
    pub fn authorize(&self, header: Option<&str>) -> ServerResult<String> {
        let header =
            header.ok_or_else(|| ServerError::AuthenticationFailed("missing credentials".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ServerError::AuthenticationFailed("not a bearer token".into()))?;
        self.validate_token(token.trim())
    }
}
