//! Payload shape handling and timestamp conversion.
//!
//! # Payload Flow
//!
//! ```text
//! RawSnapshot.payload
//!        │
//!        ▼
//! ┌─────────────────────────────┐
//! │ 1. Locate entries           │
//! │    - bare array             │
//! │    - object[entries_key]    │
//! ├─────────────────────────────┤
//! │ 2. GPS timestamp            │
//! │    - epoch ms, read as UTC  │
//! │    - convert to target tz   │
//! └─────────────────────────────┘
//! ```
use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use serde_json::Value;

use crate::config::IngestConfig;
use crate::error::IngestError;

/// Locate the entry sequence inside a snapshot payload.
///
/// Accepts a bare array, or an object carrying the array under
/// [`IngestConfig::entries_key`].
pub fn extract_entries<'a>(
    payload: &'a Value,
    cfg: &IngestConfig,
) -> Result<&'a [Value], IngestError> {
    match payload {
        Value::Array(entries) => Ok(entries.as_slice()),
        Value::Object(object) => {
            let key = cfg.entries_key.as_deref().ok_or_else(|| {
                IngestError::malformed("object payload but no entries key is configured")
            })?;
            match object.get(key) {
                Some(Value::Array(entries)) => Ok(entries.as_slice()),
                Some(other) => Err(IngestError::malformed(format!(
                    "'{key}' holds {} instead of an array",
                    value_kind(other)
                ))),
                None => Err(IngestError::malformed(format!(
                    "object payload has no '{key}' entry array"
                ))),
            }
        }
        other => Err(IngestError::malformed(format!(
            "expected an array or object, got {}",
            value_kind(other)
        ))),
    }
}

/// Read a GPS timestamp value as epoch milliseconds.
///
/// Integers, integer strings and finite floats (truncated) are accepted;
/// `null` means the record has no GPS fix time.
pub fn epoch_millis(field: &str, value: &Value) -> Result<Option<i64>, IngestError> {
    let invalid = || IngestError::InvalidTimestamp {
        field: field.to_string(),
        value: value.to_string(),
    };

    match value {
        Value::Null => Ok(None),
        Value::Number(n) => {
            if let Some(ms) = n.as_i64() {
                Ok(Some(ms))
            } else {
                match n.as_f64() {
                    Some(f) if f.is_finite() && f.abs() < i64::MAX as f64 => Ok(Some(f as i64)),
                    _ => Err(invalid()),
                }
            }
        }
        Value::String(s) => s.trim().parse::<i64>().map(Some).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

/// Interpret epoch milliseconds as UTC and convert them to `tz`.
pub fn to_timezone(field: &str, millis: i64, tz: Tz) -> Result<DateTime<FixedOffset>, IngestError> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|utc| utc.with_timezone(&tz).fixed_offset())
        .ok_or_else(|| IngestError::InvalidTimestamp {
            field: field.to_string(),
            value: millis.to_string(),
        })
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use serde_json::json;

    #[test]
    fn bare_array_accepted() {
        let payload = json!([{"codigo": 1}]);
        let entries = extract_entries(&payload, &IngestConfig::default()).expect("array");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn nested_array_accepted() {
        let payload = json!({"veiculos": [{"codigo": 1}, {"codigo": 2}]});
        let entries = extract_entries(&payload, &IngestConfig::default()).expect("nested");
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn object_without_entries_rejected() {
        let payload = json!({"status": "ok"});
        let res = extract_entries(&payload, &IngestConfig::default());
        assert!(matches!(res, Err(IngestError::MalformedPayload(msg)) if msg.contains("veiculos")));
    }

    #[test]
    fn nested_non_array_rejected() {
        let payload = json!({"veiculos": "none"});
        let res = extract_entries(&payload, &IngestConfig::default());
        assert!(matches!(res, Err(IngestError::MalformedPayload(msg)) if msg.contains("a string")));
    }

    #[test]
    fn scalar_payload_rejected() {
        let payload = json!(12);
        let res = extract_entries(&payload, &IngestConfig::default());
        assert!(matches!(res, Err(IngestError::MalformedPayload(_))));
    }

    #[test]
    fn epoch_millis_accepts_numeric_shapes() {
        assert_eq!(epoch_millis("t", &json!(1_700_000_000_000_i64)), Ok(Some(1_700_000_000_000)));
        assert_eq!(epoch_millis("t", &json!("1700000000000")), Ok(Some(1_700_000_000_000)));
        assert_eq!(epoch_millis("t", &json!(1_700_000_000_000.9)), Ok(Some(1_700_000_000_000)));
        assert_eq!(epoch_millis("t", &Value::Null), Ok(None));
    }

    #[test]
    fn epoch_millis_rejects_text() {
        let res = epoch_millis("gps_timestamp", &json!("2024-01-01"));
        assert!(matches!(res, Err(IngestError::InvalidTimestamp { field, .. }) if field == "gps_timestamp"));
        assert!(epoch_millis("t", &json!([1])).is_err());
    }

    #[test]
    fn converts_utc_millis_to_target_zone() {
        // 2024-01-01T12:00:00Z
        let ts = to_timezone("t", 1_704_110_400_000, chrono_tz::America::Sao_Paulo)
            .expect("in range");
        assert_eq!(ts.offset().local_minus_utc(), -3 * 3600);
        assert_eq!(ts.hour(), 9);
        assert_eq!(ts.timestamp_millis(), 1_704_110_400_000);
    }

    #[test]
    fn out_of_range_millis_rejected() {
        assert!(to_timezone("t", i64::MAX, chrono_tz::UTC).is_err());
    }
}
