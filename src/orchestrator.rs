//! One pass through the gated stage chain.
//!
//! ```text
//! fetch → normalize → accumulate → publish → transform
//! ```
//!
//! Every stage receives the previous stage's [`StageResult`]. An upstream
//! `Err` flows through unchanged (or wrapped) and the receiving stage performs
//! no side effects, so a failed fetch never touches the accumulator, storage or
//! the transformation tool.
use std::sync::Arc;

use async_trait::async_trait;
use ingest::IngestConfig;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::accumulator::WindowedAccumulator;
use crate::clock::{Clock, SystemClock};
use crate::error::StageResult;
use crate::fetch::{fetch_stage, SnapshotSource};
use crate::normalize_stage;
use crate::publish::Publisher;
use crate::scheduler::PipelineCycle;
use crate::transform::{TransformAck, TransformTrigger};

/// The full pipeline. Owns the accumulator, so at most one run can mutate it
/// at a time.
pub struct Pipeline {
    source: Arc<dyn SnapshotSource>,
    ingest: IngestConfig,
    accumulator: WindowedAccumulator,
    publisher: Publisher,
    trigger: TransformTrigger,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        ingest: IngestConfig,
        accumulator: WindowedAccumulator,
        publisher: Publisher,
        trigger: TransformTrigger,
    ) -> Self {
        Self {
            source,
            ingest,
            accumulator,
            publisher,
            trigger,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the time source used for capture and enqueue timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn accumulator(&self) -> &WindowedAccumulator {
        &self.accumulator
    }

    pub fn ingest_config(&self) -> &IngestConfig {
        &self.ingest
    }

    /// Run every stage once.
    ///
    /// Returns the transform acknowledgment when the whole chain succeeded.
    /// When the cycle failed before reaching the accumulator the error is that
    /// root cause (a fetch or normalization error), not the derived
    /// `NoData`/`Skipped` error of the later stages.
    pub async fn run_once(&mut self) -> StageResult<TransformAck> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);
        self.run_stages().instrument(span).await
    }

    async fn run_stages(&mut self) -> StageResult<TransformAck> {
        let fetched = fetch_stage(self.source.as_ref()).await;
        let normalized = normalize_stage(fetched, self.clock.now(), &self.ingest);

        let (consolidated, upstream_failure) = match normalized {
            Ok(batch) => (self.accumulator.accept_at(batch, self.clock.now()), None),
            Err(err) => (None, Some(err)),
        };

        let published = self.publisher.publish(consolidated).await;
        let transformed = self.trigger.trigger(published).await;

        debug!(
            buffered = self.accumulator.len(),
            ok = transformed.is_ok(),
            "pipeline_run_complete"
        );

        match (upstream_failure, transformed) {
            (Some(root), Err(_)) => Err(root),
            (_, result) => result,
        }
    }
}

#[async_trait]
impl PipelineCycle for Pipeline {
    async fn run_cycle(&mut self) -> StageResult<TransformAck> {
        self.run_once().await
    }
}
