//! Core data model types for the ingest crate.
//!
//! These types represent one poll of the position feed as it moves from the
//! raw source payload to the normalized batch handed to the accumulator.
//!
//! # Type Hierarchy
//!
//! ```text
//! RawSnapshot
//! └── payload: Value            (bare array, or array under `entries_key`)
//!
//!         ↓ normalize()
//!
//! NormalizedBatch
//! ├── captured_at: DateTime<Utc>
//! ├── source_entries: usize
//! ├── duplicates_dropped: usize
//! └── records: Vec<NormalizedRecord>
//!     ├── fields: Map<String, Value>           (canonical names)
//!     ├── capture_timestamp: DateTime<Utc>
//!     ├── gps_timestamp: Option<DateTime<FixedOffset>>
//!     └── key: IdentityKey
//! ```
use std::fmt;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque payload returned by one poll of the position feed.
///
/// The snapshot is transient: it lives for a single poll cycle and is consumed
/// by [`normalize`](crate::normalize).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawSnapshot {
    pub payload: Value,
}

impl RawSnapshot {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }

    /// Decode a snapshot from a JSON response body.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body).map(Self::new)
    }
}

impl From<Value> for RawSnapshot {
    fn from(payload: Value) -> Self {
        Self::new(payload)
    }
}

/// Identity used to detect duplicate observations: `(vehicle_id, gps_timestamp)`.
///
/// Vehicle ids are compared by their scalar text, so `42` and `"42"` are the
/// same vehicle. The GPS component is the instant in epoch milliseconds, which
/// makes the key independent of the timezone the timestamp is rendered in.
/// Missing components compare equal to each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub vehicle_id: Option<String>,
    pub gps_timestamp_ms: Option<i64>,
}

impl IdentityKey {
    pub fn new(vehicle_id: Option<String>, gps_timestamp_ms: Option<i64>) -> Self {
        Self {
            vehicle_id,
            gps_timestamp_ms,
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vehicle = self.vehicle_id.as_deref().unwrap_or("-");
        match self.gps_timestamp_ms {
            Some(ms) => write!(f, "{vehicle}@{ms}"),
            None => write!(f, "{vehicle}@-"),
        }
    }
}

/// One vehicle observation in canonical shape.
///
/// `fields` holds every mapped canonical field except the GPS timestamp, which
/// is lifted into the typed [`gps_timestamp`](Self::gps_timestamp) slot after
/// timezone conversion. Partial records are allowed: downstream code must
/// tolerate any canonical field being absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub fields: Map<String, Value>,
    pub capture_timestamp: DateTime<Utc>,
    pub gps_timestamp: Option<DateTime<FixedOffset>>,
    pub key: IdentityKey,
}

impl NormalizedRecord {
    /// Look up a canonical field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn identity_key(&self) -> &IdentityKey {
        &self.key
    }
}

/// Records produced by a single poll, already deduplicated keep-first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBatch {
    pub captured_at: DateTime<Utc>,
    /// Entry count in the raw payload before mapping and deduplication.
    pub source_entries: usize,
    pub duplicates_dropped: usize,
    pub records: Vec<NormalizedRecord>,
}

impl NormalizedBatch {
    /// An empty batch for a poll that produced nothing usable.
    pub fn empty(captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            source_entries: 0,
            duplicates_dropped: 0,
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NormalizedRecord> {
        self.records.iter()
    }
}

impl IntoIterator for NormalizedBatch {
    type Item = NormalizedRecord;
    type IntoIter = std::vec::IntoIter<NormalizedRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Render a scalar JSON value as plain text.
///
/// Strings are returned without quotes, `null` maps to `None`, and
/// non-scalar values fall back to compact JSON.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}
