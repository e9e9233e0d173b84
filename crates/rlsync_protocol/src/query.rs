//! Collection query construction.

use crate::error::{ProtocolError, ProtocolResult};
use crate::timestamp::millis_to_decimal_seconds;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Server-side ordering for collection fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortOrder {
    /// Oldest modification first.
    Oldest,
    /// Newest modification first.
    Newest,
    /// By sort index, highest first.
    Index,
}

impl SortOrder {
    /// Returns the query-string value.
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Oldest => "oldest",
            SortOrder::Newest => "newest",
            SortOrder::Index => "index",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortOrder {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oldest" => Ok(SortOrder::Oldest),
            "newest" => Ok(SortOrder::Newest),
            "index" => Ok(SortOrder::Index),
            other => Err(ProtocolError::InvalidRecord(format!(
                "unknown sort order: {}",
                other
            ))),
        }
    }
}

/// The `batch` query parameter of a batched upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchParam {
    /// `batch=true`: open a new server batch.
    Start,
    /// `batch=<token>`: append to an open batch.
    Token(String),
}

/// Query parameters for a collection request.
///
/// ```
/// use rlsync_protocol::{CollectionQuery, SortOrder};
/// use url::Url;
///
/// let base = Url::parse("https://sync.example.com/1.5/42/storage/bookmarks").unwrap();
/// let url = CollectionQuery::new()
///     .full()
///     .newer(1_500)
///     .limit(10)
///     .sort(SortOrder::Oldest)
///     .to_url(&base);
/// assert_eq!(url.query(), Some("full=1&newer=1.50&limit=10&sort=oldest"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionQuery {
    full: bool,
    newer: Option<i64>,
    limit: Option<u64>,
    sort: Option<SortOrder>,
    ids: Vec<String>,
    offset: Option<String>,
    batch: Option<BatchParam>,
    commit: bool,
}

impl CollectionQuery {
    /// Creates an empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests full record bodies instead of ids only.
    pub fn full(mut self) -> Self {
        self.full = true;
        self
    }

    /// Restricts to records modified after `millis`.
    pub fn newer(mut self, millis: i64) -> Self {
        self.newer = Some(millis);
        self
    }

    /// Caps the number of returned records.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the sort order.
    pub fn sort(mut self, sort: SortOrder) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Restricts to the given ids.
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Continues a paged fetch from a server offset token.
    pub fn offset(mut self, offset: impl Into<String>) -> Self {
        self.offset = Some(offset.into());
        self
    }

    /// Sets the batch parameter for an upload.
    pub fn batch(mut self, batch: BatchParam) -> Self {
        self.batch = Some(batch);
        self
    }

    /// Marks an upload as the commit of its batch.
    pub fn commit(mut self) -> Self {
        self.commit = true;
        self
    }

    /// Returns the `newer` bound in milliseconds.
    pub fn newer_millis(&self) -> Option<i64> {
        self.newer
    }

    /// Appends the query to `base`, replacing any existing query string.
    pub fn to_url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        url.set_query(None);
        {
            let mut pairs = url.query_pairs_mut();
            if self.full {
                pairs.append_pair("full", "1");
            }
            if let Some(newer) = self.newer {
                pairs.append_pair("newer", &millis_to_decimal_seconds(newer));
            }
            if let Some(limit) = self.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
            if let Some(sort) = self.sort {
                pairs.append_pair("sort", sort.as_str());
            }
            if !self.ids.is_empty() {
                pairs.append_pair("ids", &self.ids.join(","));
            }
            if let Some(offset) = &self.offset {
                pairs.append_pair("offset", offset);
            }
            match &self.batch {
                Some(BatchParam::Start) => {
                    pairs.append_pair("batch", "true");
                }
                Some(BatchParam::Token(token)) => {
                    pairs.append_pair("batch", token);
                }
                None => {}
            }
            if self.commit {
                pairs.append_pair("commit", "true");
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        url
    }

    /// Parses the query string of `url` back into a query.
    ///
    /// Unknown parameters are ignored.
    pub fn from_url(url: &Url) -> ProtocolResult<Self> {
        let mut query = Self::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "full" => query.full = value == "1" || value == "true",
                "newer" => {
                    query.newer = Some(crate::timestamp::decimal_seconds_to_millis(&value)?)
                }
                "limit" => {
                    query.limit = Some(value.parse().map_err(|_| {
                        ProtocolError::InvalidUrl(format!("bad limit: {}", value))
                    })?)
                }
                "sort" => query.sort = Some(value.parse()?),
                "ids" => {
                    query.ids = value
                        .split(',')
                        .filter(|id| !id.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                "offset" => query.offset = Some(value.into_owned()),
                "batch" => {
                    query.batch = Some(if value == "true" {
                        BatchParam::Start
                    } else {
                        BatchParam::Token(value.into_owned())
                    })
                }
                "commit" => query.commit = value == "true",
                _ => {}
            }
        }
        Ok(query)
    }

    /// Returns true if full bodies were requested.
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Returns the record limit.
    pub fn limit_value(&self) -> Option<u64> {
        self.limit
    }

    /// Returns the sort order.
    pub fn sort_value(&self) -> Option<SortOrder> {
        self.sort
    }

    /// Returns the requested ids.
    pub fn ids_value(&self) -> &[String] {
        &self.ids
    }

    /// Returns the offset token.
    pub fn offset_value(&self) -> Option<&str> {
        self.offset.as_deref()
    }

    /// Returns the batch parameter.
    pub fn batch_value(&self) -> Option<&BatchParam> {
        self.batch.as_ref()
    }

    /// Returns true if this upload commits its batch.
    pub fn is_commit(&self) -> bool {
        self.commit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/1.1/u/storage/history?stale=1").unwrap()
    }

    #[test]
    fn empty_query_strips_existing() {
        let url = CollectionQuery::new().to_url(&base());
        assert_eq!(url.as_str(), "https://example.com/1.1/u/storage/history");
    }

    #[test]
    fn ids_are_comma_joined() {
        let url = CollectionQuery::new().ids(["a", "b"]).to_url(&base());
        assert_eq!(url.query(), Some("ids=a%2Cb"));
    }

    #[test]
    fn batch_params() {
        let url = CollectionQuery::new()
            .batch(BatchParam::Token("xyz".into()))
            .commit()
            .to_url(&base());
        assert_eq!(url.query(), Some("batch=xyz&commit=true"));

        let url = CollectionQuery::new().batch(BatchParam::Start).to_url(&base());
        assert_eq!(url.query(), Some("batch=true"));
    }

    #[test]
    fn parses_back() {
        let original = CollectionQuery::new()
            .full()
            .newer(2_340)
            .limit(5)
            .sort(SortOrder::Newest)
            .ids(["x", "y"])
            .offset("o1");
        let parsed = CollectionQuery::from_url(&original.to_url(&base())).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn sort_order_strings() {
        assert_eq!("oldest".parse::<SortOrder>().unwrap(), SortOrder::Oldest);
        assert_eq!(SortOrder::Index.to_string(), "index");
        assert!("sideways".parse::<SortOrder>().is_err());
    }
}
