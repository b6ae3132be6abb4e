//! SQLite helper utilities for type conversion
//!
//! SQLite has no array or document columns. Lists and structured fields
//! (genres, cast/crew, detection patterns, quality info) are stored as JSON text
//! and must round-trip exactly through these helpers.

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::Result;

// ============================================================================
// Array/Vec Helpers (stored as JSON strings in SQLite)
// ============================================================================

/// Serialize a Vec to a JSON string for SQLite storage
#[inline]
pub fn vec_to_json<T: Serialize>(v: &[T]) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string())
}

/// Deserialize a JSON string from SQLite to a Vec
#[inline]
pub fn json_to_vec<T: DeserializeOwned>(s: &str) -> Vec<T> {
    serde_json::from_str(s).unwrap_or_default()
}

/// Deserialize an optional JSON string to a Vec (returns empty vec if None or invalid)
#[inline]
pub fn json_to_vec_opt<T: DeserializeOwned>(s: Option<&str>) -> Vec<T> {
    match s {
        Some(s) => json_to_vec(s),
        None => Vec::new(),
    }
}

// ============================================================================
// JSON Helpers (stored as TEXT in SQLite)
// ============================================================================

/// Serialize any serializable value to a JSON string
#[inline]
pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Serialize an optional value; `None` stays NULL rather than the text "null"
#[inline]
pub fn to_json_opt<T: Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value.map(to_json).transpose()
}

/// Deserialize a JSON string to a value
#[inline]
pub fn from_json<T: DeserializeOwned>(s: &str) -> Result<T> {
    Ok(serde_json::from_str(s)?)
}

/// Deserialize an optional JSON string
#[inline]
pub fn from_json_opt<T: DeserializeOwned>(s: Option<&str>) -> Result<Option<T>> {
    match s {
        Some(s) if !s.is_empty() && s != "null" => Ok(Some(from_json(s)?)),
        _ => Ok(None),
    }
}

// ============================================================================
// Timestamp Helpers
// ============================================================================

/// Current UTC time truncated to whole milliseconds, so stored and in-memory
/// values compare equal after a round trip.
#[inline]
pub fn now_utc() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
