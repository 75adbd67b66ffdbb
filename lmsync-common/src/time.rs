//! Timestamp utilities

use chrono::{DateTime, NaiveDate, Utc};

/// Parse a timestamp given either as RFC 3339 or as unix seconds
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    value
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
}

/// Calendar date (UTC) of a unix timestamp
pub fn unix_seconds_to_date(secs: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp(secs, 0).map(|dt| dt.date_naive())
}
