//! Windowed accumulation of normalized batches.
//!
//! The accumulator buffers one [`NormalizedBatch`] per poll and, once enough
//! of them are buffered, collapses the whole buffer into a single
//! [`ConsolidatedBatch`]. Two independent policies bound the buffer:
//!
//! - **Count**: when the buffer holds `consolidation_threshold` batches after
//!   eviction, everything buffered is consolidated and the buffer is cleared.
//! - **Age**: on every accept, batches that have been buffered for longer
//!   than the retention window are dropped, so a feed that never reaches the
//!   threshold (mostly empty polls, say) cannot grow the buffer or publish
//!   stale positions.
//!
//! Deduplication differs from the per-poll rule on purpose. Inside one poll the
//! first copy of a `(vehicle_id, gps_timestamp)` pair wins; across polls the
//! *last* copy wins, because a later poll carries the more recent report.
//!
//! The buffer lives in process memory and is owned by a single pipeline. Running
//! several collector processes against the same feed would need the buffer
//! moved to a shared store.
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use ingest::{NormalizedBatch, NormalizedRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;

/// Longest retention window accepted by [`AccumulatorConfig::validate`]: one week.
const MAX_RETENTION_SECS: u64 = 7 * 24 * 3600;

/// Count and age limits for the accumulation window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulatorConfig {
    /// Number of buffered non-empty batches that triggers consolidation.
    ///
    /// Default: `10`
    #[serde(default = "default_consolidation_threshold")]
    pub consolidation_threshold: usize,

    /// Maximum time a batch may stay buffered, in seconds.
    ///
    /// Default: `600`
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Prefix of the consolidated batch label; the window start time in
    /// `YYYYMMDD_HHMMSS` form is appended.
    ///
    /// Default: `"vehicle_positions_"`
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            consolidation_threshold: default_consolidation_threshold(),
            retention_secs: default_retention_secs(),
            label_prefix: default_label_prefix(),
        }
    }
}

impl AccumulatorConfig {
    pub fn retention(&self) -> Duration {
        Duration::seconds(self.retention_secs.min(MAX_RETENTION_SECS) as i64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consolidation_threshold == 0 {
            return Err(ConfigError::invalid(
                "consolidation_threshold",
                "must be at least 1",
            ));
        }
        if self.retention_secs == 0 || self.retention_secs > MAX_RETENTION_SECS {
            return Err(ConfigError::invalid(
                "retention_secs",
                format!("must be between 1 and {MAX_RETENTION_SECS}"),
            ));
        }
        if self
            .label_prefix
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
        {
            return Err(ConfigError::invalid(
                "label_prefix",
                "must not contain path separators or control characters",
            ));
        }
        Ok(())
    }
}

/// One consolidation window, deduplicated keep-last across polls.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidatedBatch {
    pub records: Vec<NormalizedRecord>,
    /// Enqueue time of the first batch in the window, in the label timezone.
    pub window_start: DateTime<Tz>,
    pub batch_label: String,
    pub source_batches: usize,
    pub duplicates_dropped: usize,
}

impl ConsolidatedBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug)]
struct AccumulatorEntry {
    enqueued_at: DateTime<Utc>,
    batch: NormalizedBatch,
}

/// In-memory buffer of normalized batches with count- and age-based eviction.
///
/// All mutation goes through `&mut self`, so a single owner drives it and no
/// locking is involved.
pub struct WindowedAccumulator {
    cfg: AccumulatorConfig,
    timezone: Tz,
    clock: Arc<dyn Clock>,
    entries: VecDeque<AccumulatorEntry>,
}

impl WindowedAccumulator {
    /// Create an empty accumulator. Labels and partitions are rendered in
    /// `timezone`.
    pub fn new(cfg: AccumulatorConfig, timezone: Tz) -> Self {
        Self {
            cfg,
            timezone,
            clock: Arc::new(SystemClock),
            entries: VecDeque::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &AccumulatorConfig {
        &self.cfg
    }

    /// Number of buffered batches.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total records across buffered batches, before cross-batch deduplication.
    pub fn buffered_records(&self) -> usize {
        self.entries.iter().map(|e| e.batch.len()).sum()
    }

    pub fn oldest_enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.entries.front().map(|e| e.enqueued_at)
    }

    /// Drop everything buffered without consolidating it.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Accept a batch at the clock's current time.
    pub fn accept(&mut self, batch: NormalizedBatch) -> Option<ConsolidatedBatch> {
        let now = self.clock.now();
        self.accept_at(batch, now)
    }

    /// Accept a batch enqueued at `now`.
    ///
    /// Empty batches are ignored and do not take a slot in the window. Age
    /// eviction runs on every accepted batch, before the count threshold is
    /// checked. When the threshold is reached the entire buffer is
    /// consolidated and cleared.
    pub fn accept_at(
        &mut self,
        batch: NormalizedBatch,
        now: DateTime<Utc>,
    ) -> Option<ConsolidatedBatch> {
        if batch.is_empty() {
            debug!(buffered = self.entries.len(), "accumulate_ignored_empty");
            return None;
        }

        // Enqueue times never go backwards, even if the clock does.
        let now = match self.entries.back() {
            Some(last) if last.enqueued_at > now => last.enqueued_at,
            _ => now,
        };

        let records = batch.len();
        self.entries.push_back(AccumulatorEntry {
            enqueued_at: now,
            batch,
        });

        let evicted = self.evict_expired(now);
        if evicted > 0 {
            info!(
                evicted,
                buffered = self.entries.len(),
                retention_secs = self.cfg.retention_secs,
                "accumulate_evicted"
            );
        }

        if self.entries.len() < self.cfg.consolidation_threshold {
            info!(
                records,
                buffered = self.entries.len(),
                threshold = self.cfg.consolidation_threshold,
                "accumulate_buffered"
            );
            return None;
        }

        let consolidated = self.consolidate()?;
        info!(
            batch_label = %consolidated.batch_label,
            source_batches = consolidated.source_batches,
            records = consolidated.len(),
            duplicates_dropped = consolidated.duplicates_dropped,
            "accumulate_consolidated"
        );
        Some(consolidated)
    }

    /// Remove entries buffered for longer than the retention window. An entry
    /// exactly `retention` old is kept.
    fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = now.checked_sub_signed(self.cfg.retention()) else {
            return 0;
        };
        let mut evicted = 0;
        while self
            .entries
            .front()
            .is_some_and(|entry| entry.enqueued_at < cutoff)
        {
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    fn consolidate(&mut self) -> Option<ConsolidatedBatch> {
        let window_start_utc = self.oldest_enqueued_at()?;
        let source_batches = self.entries.len();

        let flattened: Vec<NormalizedRecord> = self
            .entries
            .drain(..)
            .flat_map(|entry| entry.batch.records)
            .collect();
        let total = flattened.len();
        let records = dedupe_keep_last(flattened);

        let window_start = window_start_utc.with_timezone(&self.timezone);
        let batch_label = format!(
            "{}{}",
            self.cfg.label_prefix,
            window_start.format("%Y%m%d_%H%M%S")
        );

        Some(ConsolidatedBatch {
            duplicates_dropped: total - records.len(),
            records,
            window_start,
            batch_label,
            source_batches,
        })
    }
}

/// Keep the last occurrence of every identity key. Survivors keep the relative
/// order of their last occurrence.
fn dedupe_keep_last(records: Vec<NormalizedRecord>) -> Vec<NormalizedRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut kept: Vec<NormalizedRecord> = records
        .into_iter()
        .rev()
        .filter(|record| seen.insert(record.key.clone()))
        .collect();
    kept.reverse();
    kept
}

fn default_consolidation_threshold() -> usize {
    10
}

fn default_retention_secs() -> u64 {
    600
}

fn default_label_prefix() -> String {
    "vehicle_positions_".to_string()
}
