//! Timestamp conversions.
//!
//! The engine works in milliseconds since the Unix epoch. The Sync wire
//! format expresses server timestamps as decimal seconds with two fractional
//! digits (`"1437151394.42"`).

use crate::error::{ProtocolError, ProtocolResult};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current wall-clock time in milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Formats milliseconds as decimal seconds with two places, rounding half up.
pub fn millis_to_decimal_seconds(millis: i64) -> String {
    let negative = millis < 0;
    let hundredths = (millis.unsigned_abs() + 5) / 10;
    format!(
        "{}{}.{:02}",
        if negative { "-" } else { "" },
        hundredths / 100,
        hundredths % 100
    )
}

/// Parses a decimal-seconds string into milliseconds.
///
/// Fractional digits beyond milliseconds are truncated.
pub fn decimal_seconds_to_millis(value: &str) -> ProtocolResult<i64> {
    let value = value.trim();
    let invalid = || ProtocolError::InvalidTimestamp(value.to_string());

    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let (whole, fraction) = match digits.split_once('.') {
        Some((w, f)) => (w, f),
        None => (digits, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }

    let seconds: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let mut millis_part = String::with_capacity(3);
    for c in fraction.chars().chain(std::iter::repeat('0')).take(3) {
        millis_part.push(c);
    }
    let millis: i64 = millis_part.parse().map_err(|_| invalid())?;

    let total = seconds
        .checked_mul(1000)
        .and_then(|s| s.checked_add(millis))
        .ok_or_else(invalid)?;
    Ok(if negative { -total } else { total })
}

/// Converts floating-point seconds (as found in JSON bodies) to milliseconds.
pub fn seconds_f64_to_millis(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}
