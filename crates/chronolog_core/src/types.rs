//! Core type definitions for chronolog.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Global, 1-based, strictly increasing record identifier within a key
/// stream. Assigned exactly once at append time, never reused.
pub type Rowid = u64;

/// How records of a topic are keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// The primary-key field holds a string; one stream per distinct value.
    String,
    /// The primary-key field holds an integer, stored zero-padded so
    /// lexicographic and numeric order agree.
    Integer,
    /// No primary key: all records share one stream and are addressed only
    /// by rowid. This is the shape queue topics use.
    Rowid,
}

/// Resolution of record timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    /// Unix seconds.
    Seconds,
    /// Unix milliseconds.
    Milliseconds,
}

impl Default for TimeUnit {
    fn default() -> Self {
        Self::Seconds
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Integer => write!(f, "integer"),
            Self::Rowid => write!(f, "rowid"),
        }
    }
}

/// Stream name used on disk for rowid-keyed topics.
///
/// Rowid-keyed topics have no primary key, so every record lands in this
/// single bucket under `keys/`.
pub const ROWID_KEY: &str = "rows";

/// Width integer keys are zero-padded to, wide enough for any `u64`.
pub const INT_KEY_WIDTH: usize = 19;

/// Formats an integer primary key as its on-disk stream name.
#[must_use]
pub fn format_int_key(value: u64) -> String {
    format!("{value:0width$}", width = INT_KEY_WIDTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_key_is_zero_padded() {
        assert_eq!(format_int_key(7), "0000000000000000007");
        assert_eq!(format_int_key(7).len(), INT_KEY_WIDTH);
    }

    #[test]
    fn int_key_order_matches_numeric_order() {
        let a = format_int_key(99);
        let b = format_int_key(100);
        assert!(a < b);
    }

    #[test]
    fn key_type_serde_round_trip() {
        let json = serde_json::to_string(&KeyType::Rowid).unwrap();
        assert_eq!(json, "\"rowid\"");
        let back: KeyType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, KeyType::Rowid);
    }
}
