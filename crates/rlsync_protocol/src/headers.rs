//! Header names and value parsers.

use crate::timestamp::decimal_seconds_to_millis;
use chrono::DateTime;

/// Server clock at response time, decimal seconds.
pub const X_WEAVE_TIMESTAMP: &str = "x-weave-timestamp";
/// Collection last-modified time, decimal seconds.
pub const X_LAST_MODIFIED: &str = "x-last-modified";
/// Offset token for the next page of a paged fetch.
pub const X_WEAVE_NEXT_OFFSET: &str = "x-weave-next-offset";
/// Advisory backoff in seconds.
pub const X_WEAVE_BACKOFF: &str = "x-weave-backoff";
/// Advisory backoff in seconds (Reading List / Kinto style).
pub const BACKOFF: &str = "backoff";
/// Retry delay in seconds or as an HTTP-date.
pub const RETRY_AFTER: &str = "retry-after";
/// Number of records in a collection response.
pub const X_WEAVE_RECORDS: &str = "x-weave-records";
/// Remaining storage quota in KB.
pub const X_WEAVE_QUOTA_REMAINING: &str = "x-weave-quota-remaining";
/// Conditional-write precondition, decimal seconds.
pub const X_IF_UNMODIFIED_SINCE: &str = "x-if-unmodified-since";
/// Required on collection-wide deletes.
pub const X_CONFIRM_DELETE: &str = "x-confirm-delete";
/// Reading List item count.
pub const TOTAL_RECORDS: &str = "total-records";
/// Reading List collection timestamp, integer milliseconds.
pub const LAST_MODIFIED: &str = "last-modified";
/// Reading List conditional GET, integer milliseconds.
pub const IF_MODIFIED_SINCE: &str = "if-modified-since";
/// Reading List conditional write, integer milliseconds.
pub const IF_UNMODIFIED_SINCE: &str = "if-unmodified-since";
/// Request/response content type.
pub const CONTENT_TYPE: &str = "content-type";
/// Authorization header.
pub const AUTHORIZATION: &str = "authorization";
/// Newline-delimited JSON media type.
pub const NEWLINES_MEDIA_TYPE: &str = "application/newlines";
/// JSON media type.
pub const JSON_MEDIA_TYPE: &str = "application/json";

/// Parses a decimal-seconds header into milliseconds.
pub fn parse_decimal_seconds(value: &str) -> Option<i64> {
    decimal_seconds_to_millis(value).ok()
}

/// Parses an integer header.
pub fn parse_integer(value: &str) -> Option<i64> {
    value.trim().parse().ok()
}

/// Parses a backoff header given in whole or fractional seconds.
pub fn parse_backoff_seconds(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs);
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| secs.ceil() as u64)
}

/// Parses `Retry-After`, which is either delta-seconds or an HTTP-date.
///
/// Dates are converted to a delay relative to `now_millis`; dates in the
/// past yield zero.
pub fn parse_retry_after(value: &str, now_millis: i64) -> Option<u64> {
    if let Some(secs) = parse_backoff_seconds(value) {
        return Some(secs);
    }
    let date = DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let delta_millis = date.timestamp_millis().saturating_sub(now_millis);
    Some(if delta_millis <= 0 {
        0
    } else {
        (delta_millis as u64).div_ceil(1000)
    })
}
