//! Writing consolidated batches to object storage as CSV.
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{Datelike, SecondsFormat};
use ingest::{IngestConfig, NormalizedRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::accumulator::ConsolidatedBatch;
use crate::error::{ConfigError, PublishError, StageError, StageResult};
use crate::storage::ObjectStorage;

pub const CSV_CONTENT_TYPE: &str = "text/csv";
pub const CAPTURE_TIMESTAMP_COLUMN: &str = ingest::CAPTURE_TIMESTAMP_FIELD;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Leading path segment of every object key.
    ///
    /// Default: `"staging"`
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
        }
    }
}

impl PublishConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() || prefix.split('/').any(|seg| seg.is_empty() || seg == "..") {
            return Err(ConfigError::invalid(
                "publish.prefix",
                "must be a non-empty relative path",
            ));
        }
        Ok(())
    }
}

/// Acknowledgment of a stored batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub key: String,
    pub location: String,
    pub records: usize,
    pub bytes: usize,
}

impl PublishAck {
    /// Always `true`; a failed publish is an `Err`, never an ack.
    pub fn published(&self) -> bool {
        true
    }
}

/// Column layout of the published CSV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvLayout {
    columns: Vec<String>,
    gps_timestamp_field: String,
}

impl CsvLayout {
    /// Every canonical field in mapping order, then the capture timestamp.
    pub fn from_ingest(cfg: &IngestConfig) -> Self {
        let mut columns: Vec<String> = cfg.field_mapping.targets().map(str::to_string).collect();
        columns.push(CAPTURE_TIMESTAMP_COLUMN.to_string());
        Self {
            columns,
            gps_timestamp_field: cfg.gps_timestamp_field.clone(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    fn cell(&self, record: &NormalizedRecord, column: &str) -> String {
        if column == self.gps_timestamp_field {
            return record
                .gps_timestamp
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
                .unwrap_or_default();
        }
        if column == CAPTURE_TIMESTAMP_COLUMN {
            return record
                .capture_timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true);
        }
        match record.get(column) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Bool(b)) => b.to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => other.to_string(),
        }
    }

    /// Encode records as CSV with a header row.
    pub fn encode(&self, records: &[NormalizedRecord]) -> Result<Vec<u8>, PublishError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(&self.columns)
            .map_err(|e| PublishError::Encode(e.to_string()))?;
        for record in records {
            writer
                .write_record(self.columns.iter().map(|c| self.cell(record, c)))
                .map_err(|e| PublishError::Encode(e.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|e| PublishError::Encode(e.to_string()))
    }
}

/// Object key for a batch: `{prefix}/{year}/{month}/{day}/{label}.csv`, with
/// the date taken from the window start in the label timezone.
pub fn storage_key(prefix: &str, batch: &ConsolidatedBatch) -> String {
    let start = &batch.window_start;
    format!(
        "{}/{}/{:02}/{:02}/{}.csv",
        prefix.trim_matches('/'),
        start.year(),
        start.month(),
        start.day(),
        batch.batch_label
    )
}

/// Publish stage: serializes a consolidated batch and hands it to storage.
pub struct Publisher {
    storage: Arc<dyn ObjectStorage>,
    layout: CsvLayout,
    cfg: PublishConfig,
}

impl Publisher {
    pub fn new(storage: Arc<dyn ObjectStorage>, layout: CsvLayout, cfg: PublishConfig) -> Self {
        Self {
            storage,
            layout,
            cfg,
        }
    }

    pub fn layout(&self) -> &CsvLayout {
        &self.layout
    }

    /// `None` means the accumulator did not fire this cycle; that is reported
    /// as [`StageError::NoData`] and nothing is written.
    pub async fn publish(&self, batch: Option<ConsolidatedBatch>) -> StageResult<PublishAck> {
        let Some(batch) = batch else {
            return Err(StageError::NoData);
        };

        let start = Instant::now();
        let key = storage_key(&self.cfg.prefix, &batch);
        match self.write(&key, &batch).await {
            Ok(ack) => {
                info!(
                    key = %ack.key,
                    location = %ack.location,
                    records = ack.records,
                    bytes = ack.bytes,
                    elapsed_micros = start.elapsed().as_micros() as u64,
                    "publish_success"
                );
                Ok(ack)
            }
            Err(err) => {
                warn!(
                    key = %key,
                    error = %err,
                    elapsed_micros = start.elapsed().as_micros() as u64,
                    "publish_failure"
                );
                Err(err.into())
            }
        }
    }

    async fn write(&self, key: &str, batch: &ConsolidatedBatch) -> Result<PublishAck, PublishError> {
        let body = self.layout.encode(&batch.records)?;
        let bytes = body.len();
        let location = self
            .storage
            .write(key, Bytes::from(body), CSV_CONTENT_TYPE)
            .await?;
        Ok(PublishAck {
            key: key.to_string(),
            location,
            records: batch.len(),
            bytes,
        })
    }
}

fn default_prefix() -> String {
    "staging".to_string()
}
