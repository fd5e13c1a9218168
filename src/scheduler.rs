//! Fixed-interval driver for the pipeline.
//!
//! The loop has two states. It starts `Running` and only becomes `Stopped`
//! when the cancellation token fires. A cycle that returns an error, or even
//! panics, is logged and counted; the loop then waits and runs again.
//!
//! Cycles never overlap: the wait starts after a cycle finishes, so the
//! effective period is the cycle duration plus the delay. Cancellation cuts a
//! wait short but never interrupts a cycle in progress.
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::StageResult;
use crate::transform::TransformAck;

/// One schedulable unit of work.
#[async_trait]
pub trait PipelineCycle: Send {
    async fn run_cycle(&mut self) -> StageResult<TransformAck>;
}

/// How long to wait after a cycle before starting the next one.
pub trait Tick: Send + Sync {
    fn delay(&self) -> Duration;
}

/// The same delay after every cycle, with no drift compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay(pub Duration);

impl Tick for FixedDelay {
    fn delay(&self) -> Duration {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    Stopped,
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerSummary {
    pub cycles: u64,
    pub succeeded: u64,
    /// Cycles where nothing was consolidated.
    pub idle: u64,
    pub failures: u64,
}

pub struct Scheduler<T: Tick = FixedDelay> {
    tick: T,
    state: SchedulerState,
}

impl Scheduler<FixedDelay> {
    pub fn fixed(interval: Duration) -> Self {
        Self::new(FixedDelay(interval))
    }
}

impl<T: Tick> Scheduler<T> {
    pub fn new(tick: T) -> Self {
        Self {
            tick,
            state: SchedulerState::Running,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Drive `cycle` until `cancel` fires.
    pub async fn run<C>(&mut self, cycle: &mut C, cancel: &CancellationToken) -> SchedulerSummary
    where
        C: PipelineCycle + ?Sized,
    {
        self.state = SchedulerState::Running;
        let mut summary = SchedulerSummary::default();
        info!(delay_secs = self.tick.delay().as_secs(), "scheduler_started");

        while !cancel.is_cancelled() {
            let outcome = AssertUnwindSafe(cycle.run_cycle()).catch_unwind().await;
            summary.cycles += 1;

            match outcome {
                Ok(Ok(ack)) => {
                    summary.succeeded += 1;
                    info!(
                        cycle = summary.cycles,
                        transform_micros = ack.elapsed.as_micros() as u64,
                        "cycle_success"
                    );
                }
                Ok(Err(err)) if err.is_idle() => {
                    summary.idle += 1;
                    info!(cycle = summary.cycles, "cycle_idle");
                }
                Ok(Err(err)) => {
                    summary.failures += 1;
                    warn!(
                        cycle = summary.cycles,
                        stage = err.root_cause().stage(),
                        error = %err,
                        "cycle_failure"
                    );
                }
                Err(panic) => {
                    summary.failures += 1;
                    error!(
                        cycle = summary.cycles,
                        panic = panic_message(panic.as_ref()),
                        "cycle_panicked"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.tick.delay()) => {}
            }
        }

        self.state = SchedulerState::Stopped;
        info!(
            cycles = summary.cycles,
            succeeded = summary.succeeded,
            idle = summary.idle,
            failures = summary.failures,
            "scheduler_stopped"
        );
        summary
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
