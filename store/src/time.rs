//! Timestamp helpers
//!
//! Every persisted timestamp is an ISO-8601 UTC string with fixed
//! millisecond precision and a `Z` suffix, so lexicographic comparison in
//! SQL matches chronological order.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::StoreError;

/// Current time in Unix milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Serialize a timestamp to its canonical stored form
pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp back into a native value
pub fn parse_iso(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| StoreError::Timestamp {
            value: value.to_string(),
            source,
        })
}

/// Parse an optional stored timestamp
pub fn parse_iso_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(|v| parse_iso(&v)).transpose()
}
