//! Terminal-time extraction from fetched payloads

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Naive formats accepted besides RFC 3339; read as UTC
const NAIVE_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Reads an item's closing time out of its payload
///
/// # Arguments
///
/// * `payload` - The fetched payload
/// * `field` - A top-level key, or a JSON pointer when it starts with `/`
///
/// # Returns
///
/// The parsed time, or `None` when the field is missing, not a string or
/// not a recognizable timestamp
pub fn extract_terminal_at(payload: &Value, field: &str) -> Option<DateTime<Utc>> {
    let value = if field.starts_with('/') {
        payload.pointer(field)
    } else {
        payload.get(field)
    }?;

    parse_timestamp(value.as_str()?.trim())
}

/// Parses an RFC 3339 or naive timestamp
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}
