//! Vehicle-position feed collector.
//!
//! Polls a GPS feed on a fixed interval, normalizes each snapshot, buffers the
//! results in a rolling window and, every `consolidation_threshold` polls,
//! writes one deduplicated CSV to object storage and runs the downstream
//! transformation.
//!
//! ```text
//! Scheduler ──▶ Pipeline::run_once
//!                 fetch ─▶ normalize ─▶ accumulate ─▶ publish ─▶ transform
//! ```
//!
//! Each arrow carries a [`StageResult`]. A stage that receives an `Err` skips
//! its own work and passes the failure on, so every outcome of a cycle is a
//! value and the scheduler keeps running whatever happens.
//!
//! Field mapping and per-poll normalization live in the `ingest` crate and are
//! re-exported here.

pub mod accumulator;
pub mod clock;
pub mod config;
pub mod error;
pub mod fetch;
pub mod orchestrator;
pub mod publish;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod transform;

pub use ingest::{
    normalize, FieldMapping, FieldRule, IdentityKey, IngestConfig, IngestError, NormalizedBatch,
    NormalizedRecord, RawSnapshot,
};

pub use crate::accumulator::{AccumulatorConfig, ConsolidatedBatch, WindowedAccumulator};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::PipelineConfig;
pub use crate::error::{
    ConfigError, FetchError, PublishError, StageError, StageResult, TransformError,
};
pub use crate::fetch::{fetch_stage, HttpSnapshotSource, SnapshotSource};
pub use crate::orchestrator::Pipeline;
pub use crate::publish::{storage_key, CsvLayout, PublishAck, PublishConfig, Publisher};
pub use crate::retry::RetryConfig;
pub use crate::scheduler::{
    FixedDelay, PipelineCycle, Scheduler, SchedulerState, SchedulerSummary, Tick,
};
pub use crate::storage::{
    ApplicationDefaultCredentials, GcsStorage, InMemoryStorage, LocalStorage, ObjectStorage,
    StaticToken, StorageConfig, TokenSource,
};
pub use crate::transform::{
    CommandRunner, TransformAck, TransformConfig, TransformRunner, TransformTrigger,
};

use chrono::{DateTime, Utc};

/// Normalize stage: forwards an upstream fetch error unchanged, otherwise
/// normalizes the snapshot captured at `captured_at`.
pub fn normalize_stage(
    fetched: StageResult<RawSnapshot>,
    captured_at: DateTime<Utc>,
    cfg: &IngestConfig,
) -> StageResult<NormalizedBatch> {
    let snapshot = fetched?;
    Ok(ingest::normalize(snapshot, captured_at, cfg)?)
}
