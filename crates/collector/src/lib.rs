//! Collector process for the vehicle-position feed.
//!
//! Loads configuration, installs logging, builds the pipeline and drives it
//! with the fixed-interval scheduler until Ctrl+C or SIGTERM.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use collector::CollectorConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CollectorConfig::load()?;
//!     collector::logging::init(&config.log)?;
//!     collector::run(config).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Shutdown
//!
//! A signal cancels the scheduler's token. A cycle already in progress runs to
//! completion; the wait before the next one is cut short and the process exits.

pub mod config;
pub mod logging;

pub use crate::config::{CollectorConfig, LogConfig, LogFormat};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use transit_feed::{PipelineCycle, SchedulerSummary};

/// Build the pipeline and run it until a shutdown signal arrives (or for a
/// single cycle when `run_once` is set).
pub async fn run(config: CollectorConfig) -> anyhow::Result<SchedulerSummary> {
    let mut pipeline = config
        .pipeline
        .build_pipeline()
        .context("invalid pipeline configuration")?;

    info!(
        api_url = %config.pipeline.api_url,
        poll_interval_secs = config.pipeline.poll_interval_secs,
        threshold = config.pipeline.accumulator.consolidation_threshold,
        retention_secs = config.pipeline.accumulator.retention_secs,
        "collector_started"
    );

    if config.run_once {
        return run_single(&mut pipeline).await;
    }

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        stopper.cancel();
    });

    let summary = config.pipeline.scheduler().run(&mut pipeline, &cancel).await;
    info!("collector shutdown complete");
    Ok(summary)
}

async fn run_single(pipeline: &mut dyn PipelineCycle) -> anyhow::Result<SchedulerSummary> {
    let mut summary = SchedulerSummary {
        cycles: 1,
        ..Default::default()
    };
    match pipeline.run_cycle().await {
        Ok(_) => summary.succeeded = 1,
        Err(err) if err.is_idle() => summary.idle = 1,
        Err(err) => {
            return Err(anyhow::Error::new(err).context("single pipeline cycle failed"));
        }
    }
    Ok(summary)
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, stopping after the current cycle"),
        _ = terminate => info!("received SIGTERM, stopping after the current cycle"),
    }
}
