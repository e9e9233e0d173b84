//! Plain HTTP request and response values.
//!
//! These carry no client behaviour; the engine's `HttpClient` implementations
//! and the reference server both speak in terms of them.

use crate::error::{ProtocolError, ProtocolResult};
use crate::headers;
use crate::timestamp::now_millis;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read};

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET.
    Get,
    /// POST.
    Post,
    /// PUT.
    Put,
    /// PATCH.
    Patch,
    /// DELETE.
    Delete,
}

impl Method {
    /// Returns the method token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outgoing HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,
    /// Absolute request URL.
    pub url: String,
    /// Request headers in insertion order.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Creates a request without headers or body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Creates a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// Creates a DELETE request.
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    /// Creates a request carrying a JSON body.
    pub fn with_json_body(method: Method, url: impl Into<String>, body: Vec<u8>) -> Self {
        Self::new(method, url)
            .with_header(headers::CONTENT_TYPE, headers::JSON_MEDIA_TYPE)
            .with_body(body)
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Looks up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the body as UTF-8 text.
    pub fn body_text(&self) -> Option<&str> {
        self.body.as_deref().and_then(|b| std::str::from_utf8(b).ok())
    }
}

/// A response whose body is read incrementally.
pub struct HttpResponse {
    status: u16,
    headers: BTreeMap<String, String>,
    body: Box<dyn Read + Send>,
}

impl HttpResponse {
    /// Creates a response over a streaming body. Header names are lowercased.
    pub fn new<I, K, V>(status: u16, headers: I, body: Box<dyn Read + Send>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
            body,
        }
    }

    /// Creates a response over an in-memory body.
    pub fn from_bytes<I, K, V>(status: u16, headers: I, body: Vec<u8>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self::new(status, headers, Box::new(Cursor::new(body)))
    }

    /// Returns the status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Looks up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Returns all headers, lowercased.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Returns the streaming body.
    pub fn body_mut(&mut self) -> &mut (dyn Read + Send) {
        &mut *self.body
    }

    /// Consumes the response, returning the streaming body.
    pub fn into_body(self) -> Box<dyn Read + Send> {
        self.body
    }

    /// Reads the remaining body as UTF-8 text.
    pub fn text(&mut self) -> ProtocolResult<String> {
        let mut text = String::new();
        self.body
            .read_to_string(&mut text)
            .map_err(|e| ProtocolError::Body(e.to_string()))?;
        Ok(text)
    }

    /// Reads the remaining body as JSON.
    pub fn json<T: DeserializeOwned>(&mut self) -> ProtocolResult<T> {
        let text = self.text()?;
        Ok(serde_json::from_str(&text)?)
    }

    /// `X-Weave-Timestamp` in milliseconds.
    pub fn weave_timestamp(&self) -> Option<i64> {
        self.header(headers::X_WEAVE_TIMESTAMP)
            .and_then(headers::parse_decimal_seconds)
    }

    /// `X-Last-Modified` in milliseconds.
    pub fn last_modified(&self) -> Option<i64> {
        self.header(headers::X_LAST_MODIFIED)
            .and_then(headers::parse_decimal_seconds)
    }

    /// Reading List `Last-Modified`, integer milliseconds.
    pub fn reading_list_last_modified(&self) -> Option<i64> {
        self.header(headers::LAST_MODIFIED)
            .and_then(headers::parse_integer)
    }

    /// `X-Weave-Next-Offset`.
    pub fn next_offset(&self) -> Option<&str> {
        self.header(headers::X_WEAVE_NEXT_OFFSET)
            .filter(|v| !v.is_empty())
    }

    /// `X-Weave-Records`.
    pub fn weave_records(&self) -> Option<i64> {
        self.header(headers::X_WEAVE_RECORDS)
            .and_then(headers::parse_integer)
    }

    /// `X-Weave-Quota-Remaining`.
    pub fn quota_remaining(&self) -> Option<i64> {
        self.header(headers::X_WEAVE_QUOTA_REMAINING)
            .and_then(headers::parse_integer)
    }

    /// `Total-Records`.
    pub fn total_records(&self) -> Option<i64> {
        self.header(headers::TOTAL_RECORDS)
            .and_then(headers::parse_integer)
    }

    /// The largest advisory delay among the backoff headers, in seconds.
    pub fn backoff_seconds(&self) -> Option<u64> {
        let now = now_millis();
        [
            self.header(headers::X_WEAVE_BACKOFF)
                .and_then(headers::parse_backoff_seconds),
            self.header(headers::BACKOFF)
                .and_then(headers::parse_backoff_seconds),
            self.header(headers::RETRY_AFTER)
                .and_then(|v| headers::parse_retry_after(v, now)),
        ]
        .into_iter()
        .flatten()
        .max()
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}
