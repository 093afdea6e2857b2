//! Decoding helpers shared by the adapters.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::{self, Deserializer};
use serde::Deserialize;

/// RFC 3339, Jira's `+0800` offsets, or a zone-less `YYYY-MM-DD hh:mm:ss` read as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let text = String::deserialize(deserializer)?;
    parse_timestamp(&text).ok_or_else(|| de::Error::custom(format!("invalid timestamp {text:?}")))
}

pub fn opt_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(text) if text.trim().is_empty() => Ok(None),
        Some(text) => parse_timestamp(&text)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("invalid timestamp {text:?}"))),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrInt {
    Int(i64),
    Text(String),
}

/// Ids that some APIs send as strings and others as numbers.
pub fn int_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match StringOrInt::deserialize(deserializer)? {
        StringOrInt::Int(value) => Ok(value),
        StringOrInt::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("expected an integer id, got {text:?}"))),
    }
}

/// `null` and missing both become the empty string.
pub fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
