//! Vehicle-position ingest layer
//!
//! This is where a polled snapshot enters the pipeline. We take the raw JSON
//! payload, copy the fields we care about under their canonical names, stamp
//! every record with the poll time, and drop repeated observations before the
//! batch moves on to the accumulator.
//!
//! ## What we do here
//!
//! - **Locate entries** - The feed answers with a bare array or an object that
//!   nests the array under a known key. Both work.
//! - **Map fields** - [`FieldMapping`] copies present source fields to their
//!   canonical names. Missing fields are fine; entries that map to nothing are
//!   skipped.
//! - **Normalize GPS time** - Epoch milliseconds are read as UTC and rendered
//!   in the configured timezone.
//! - **Drop duplicates** - Within one poll the first observation of a
//!   `(vehicle_id, gps_timestamp)` pair wins; later copies are noise.
//! - **Log everything** - Structured logs via tracing.
//!
//! ## Main entry point
//!
//! Call [`normalize`] with a [`RawSnapshot`], the capture time and an
//! [`IngestConfig`]; get back a [`NormalizedBatch`] or a typed [`IngestError`].
//!
//! ## Example
//!
//! ```
//! use chrono::Utc;
//! use ingest::{normalize, IngestConfig, RawSnapshot};
//! use serde_json::json;
//!
//! let snapshot = RawSnapshot::new(json!({
//!     "veiculos": [
//!         {"codigo": "B-42", "dataHora": 1704110400000_i64, "velocidade": 31},
//!         {"codigo": "B-42", "dataHora": 1704110400000_i64, "velocidade": 99},
//!     ]
//! }));
//!
//! let batch = normalize(snapshot, Utc::now(), &IngestConfig::default()).unwrap();
//! assert_eq!(batch.len(), 1);
//! assert_eq!(batch.records[0].get("speed"), Some(&json!(31)));
//! ```
use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

mod config;
mod error;
mod mapping;
mod payload;
mod types;

pub use crate::config::{ConfigError, IngestConfig, CAPTURE_TIMESTAMP_FIELD};
pub use crate::error::IngestError;
pub use crate::mapping::{FieldMapping, FieldRule};
pub use crate::payload::{epoch_millis, extract_entries, to_timezone};
pub use crate::types::{
    scalar_text, IdentityKey, NormalizedBatch, NormalizedRecord, RawSnapshot,
};

/// Normalize one polled snapshot into a deduplicated batch.
pub fn normalize(
    snapshot: RawSnapshot,
    captured_at: DateTime<Utc>,
    cfg: &IngestConfig,
) -> Result<NormalizedBatch, IngestError> {
    let start = Instant::now();
    match normalize_inner(&snapshot, captured_at, cfg) {
        Ok(batch) => {
            let elapsed_micros = start.elapsed().as_micros();
            info!(
                entries = batch.source_entries,
                records = batch.len(),
                duplicates_dropped = batch.duplicates_dropped,
                elapsed_micros,
                "normalize_success"
            );
            Ok(batch)
        }
        Err(err) => {
            let elapsed_micros = start.elapsed().as_micros();
            warn!(error = %err, elapsed_micros, "normalize_failure");
            Err(err)
        }
    }
}

fn normalize_inner(
    snapshot: &RawSnapshot,
    captured_at: DateTime<Utc>,
    cfg: &IngestConfig,
) -> Result<NormalizedBatch, IngestError> {
    let entries = extract_entries(&snapshot.payload, cfg)?;

    let mut seen: HashSet<IdentityKey> = HashSet::with_capacity(entries.len());
    let mut records = Vec::with_capacity(entries.len());
    let mut skipped = 0usize;
    let mut duplicates_dropped = 0usize;

    for entry in entries {
        let Some(fields) = cfg.field_mapping.map_entry(entry) else {
            skipped += 1;
            continue;
        };
        let record = build_record(fields, captured_at, cfg)?;

        // Keep-first: the earliest copy within one poll is authoritative.
        if seen.insert(record.key.clone()) {
            records.push(record);
        } else {
            duplicates_dropped += 1;
        }
    }

    if skipped > 0 {
        debug!(skipped, "entries without mapped fields skipped");
    }

    Ok(NormalizedBatch {
        captured_at,
        source_entries: entries.len(),
        duplicates_dropped,
        records,
    })
}

/// Turn mapped fields into a record: lift the GPS timestamp into its typed
/// slot and compute the identity key.
fn build_record(
    mut fields: serde_json::Map<String, serde_json::Value>,
    captured_at: DateTime<Utc>,
    cfg: &IngestConfig,
) -> Result<NormalizedRecord, IngestError> {
    let gps_field = cfg.gps_timestamp_field.as_str();
    let gps_millis = match fields.remove(gps_field) {
        Some(value) => epoch_millis(gps_field, &value)?,
        None => None,
    };
    let gps_timestamp = gps_millis
        .map(|ms| to_timezone(gps_field, ms, cfg.target_timezone))
        .transpose()?;

    let vehicle_id = fields.get(&cfg.vehicle_id_field).and_then(scalar_text);

    Ok(NormalizedRecord {
        fields,
        capture_timestamp: captured_at,
        gps_timestamp,
        key: IdentityKey::new(vehicle_id, gps_millis),
    })
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};
    use serde_json::json;

    use super::*;

    fn fixed_timestamp() -> DateTime<Utc> {
        let Some(date) = NaiveDate::from_ymd_opt(2024, 1, 1) else {
            panic!("invalid date components");
        };
        let Some(date_time) = date.and_hms_opt(12, 0, 30) else {
            panic!("invalid time components");
        };
        DateTime::<Utc>::from_naive_utc_and_offset(date_time, Utc)
    }

    const T0: i64 = 1_704_110_400_000;

    #[test]
    fn test_normalize_nested_payload() {
        let snapshot = RawSnapshot::new(json!({
            "veiculos": [
                {"codigo": "B1", "linha": "10", "dataHora": T0, "velocidade": 40},
                {"codigo": "B2", "linha": "22", "dataHora": T0 + 1000},
            ]
        }));

        let batch = normalize(snapshot, fixed_timestamp(), &IngestConfig::default())
            .expect("normalize should succeed");
        assert_eq!(batch.source_entries, 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0].get("vehicle_id"), Some(&json!("B1")));
        assert_eq!(batch.records[0].get("line"), Some(&json!("10")));
        assert!(batch.records[1].get("speed").is_none());
    }

    #[test]
    fn test_capture_timestamp_attached_to_every_record() {
        let snapshot = RawSnapshot::new(json!([{"codigo": 1}, {"codigo": 2}, {"codigo": 3}]));
        let batch = normalize(snapshot, fixed_timestamp(), &IngestConfig::default())
            .expect("normalize should succeed");
        assert!(batch
            .iter()
            .all(|r| r.capture_timestamp == fixed_timestamp()));
        assert_eq!(batch.captured_at, fixed_timestamp());
    }

    #[test]
    fn test_gps_timestamp_converted_and_lifted() {
        let snapshot = RawSnapshot::new(json!([{"codigo": "B1", "dataHora": T0}]));
        let batch = normalize(snapshot, fixed_timestamp(), &IngestConfig::default())
            .expect("normalize should succeed");
        let record = &batch.records[0];

        assert!(record.get("gps_timestamp").is_none());
        let gps = record.gps_timestamp.expect("gps timestamp present");
        assert_eq!(gps.timestamp_millis(), T0);
        assert_eq!(gps.offset().local_minus_utc(), -3 * 3600);
        assert_eq!(
            gps,
            chrono_tz::America::Sao_Paulo
                .with_ymd_and_hms(2024, 1, 1, 9, 0, 0)
                .single()
                .expect("unambiguous local time")
                .fixed_offset()
        );
    }

    #[test]
    fn test_missing_gps_timestamp_is_not_an_error() {
        let snapshot = RawSnapshot::new(json!([{"codigo": "B1"}, {"codigo": "B2", "dataHora": null}]));
        let batch = normalize(snapshot, fixed_timestamp(), &IngestConfig::default())
            .expect("normalize should succeed");
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|r| r.gps_timestamp.is_none()));
    }

    #[test]
    fn test_duplicates_keep_first() {
        let snapshot = RawSnapshot::new(json!([
            {"codigo": 42, "dataHora": T0, "velocidade": 10},
            {"codigo": 7, "dataHora": T0, "velocidade": 20},
            {"codigo": 42, "dataHora": T0, "velocidade": 30},
            {"codigo": "42", "dataHora": T0, "velocidade": 40},
        ]));

        let batch = normalize(snapshot, fixed_timestamp(), &IngestConfig::default())
            .expect("normalize should succeed");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.duplicates_dropped, 2);
        assert_eq!(batch.records[0].get("speed"), Some(&json!(10)));
        assert_eq!(batch.records[1].get("vehicle_id"), Some(&json!(7)));
    }

    #[test]
    fn test_same_vehicle_different_fix_time_kept() {
        let snapshot = RawSnapshot::new(json!([
            {"codigo": 42, "dataHora": T0},
            {"codigo": 42, "dataHora": T0 + 15_000},
        ]));
        let batch = normalize(snapshot, fixed_timestamp(), &IngestConfig::default())
            .expect("normalize should succeed");
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_unmapped_entries_discarded() {
        let snapshot = RawSnapshot::new(json!([
            {"unknown": 1},
            "not an object",
            {"codigo": "B1"},
        ]));
        let batch = normalize(snapshot, fixed_timestamp(), &IngestConfig::default())
            .expect("normalize should succeed");
        assert_eq!(batch.source_entries, 3);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_output_never_exceeds_input() {
        let entries: Vec<_> = (0..50)
            .map(|i| json!({"codigo": i % 5, "dataHora": T0 + (i % 3) * 1000}))
            .collect();
        let batch = normalize(
            RawSnapshot::new(json!(entries)),
            fixed_timestamp(),
            &IngestConfig::default(),
        )
        .expect("normalize should succeed");
        assert!(batch.len() <= 50);
        assert_eq!(batch.len(), 15);
    }

    #[test]
    fn test_empty_entry_array_yields_empty_batch() {
        let batch = normalize(
            RawSnapshot::new(json!({"veiculos": []})),
            fixed_timestamp(),
            &IngestConfig::default(),
        )
        .expect("normalize should succeed");
        assert!(batch.is_empty());
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let res = normalize(
            RawSnapshot::new(json!("maintenance")),
            fixed_timestamp(),
            &IngestConfig::default(),
        );
        assert!(matches!(res, Err(IngestError::MalformedPayload(_))));
    }

    #[test]
    fn test_invalid_gps_timestamp_fails_whole_snapshot() {
        let res = normalize(
            RawSnapshot::new(json!([
                {"codigo": "B1", "dataHora": T0},
                {"codigo": "B2", "dataHora": "yesterday"},
            ])),
            fixed_timestamp(),
            &IngestConfig::default(),
        );
        assert!(matches!(res, Err(IngestError::InvalidTimestamp { .. })));
    }

    #[test]
    fn test_custom_identity_fields() {
        let cfg = IngestConfig {
            field_mapping: FieldMapping::new(vec![
                FieldRule::new("id", "bus"),
                FieldRule::new("ts", "fix"),
            ]),
            vehicle_id_field: "bus".into(),
            gps_timestamp_field: "fix".into(),
            target_timezone: chrono_tz::UTC,
            entries_key: None,
        };
        let batch = normalize(
            RawSnapshot::new(json!([{"id": "x", "ts": T0}, {"id": "x", "ts": T0}])),
            fixed_timestamp(),
            &cfg,
        )
        .expect("normalize should succeed");
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch.records[0].key,
            IdentityKey::new(Some("x".into()), Some(T0))
        );
    }
}
