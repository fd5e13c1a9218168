//! Pipeline configuration.
//!
//! Every section has defaults matching the BRT GPS feed, so an empty document
//! is a valid configuration. Loading from files and environment variables is
//! done by the collector binary; this module only defines the shape, checks it
//! and turns it into a [`Pipeline`].
//!
//! ## Example (YAML)
//!
//! ```yaml
//! api_url: "https://dados.mobilidade.rio/gps/brt"
//! request_timeout_secs: 60
//! poll_interval_secs: 60
//!
//! retry:
//!   max_retries: 2
//!   base_delay_ms: 500
//!
//! ingest:
//!   entries_key: veiculos
//!   target_timezone: America/Sao_Paulo
//!
//! accumulator:
//!   consolidation_threshold: 10
//!   retention_secs: 600
//!   label_prefix: brt_10min_data_
//!
//! publish:
//!   prefix: staging
//!
//! storage:
//!   kind: gcs
//!   bucket: brt-positions
//!
//! transform:
//!   program: dbt
//!   args: [run]
//!   project_dir: ./dbt/brt_project
//!   profiles_dir: ./dbt
//! ```
use std::sync::Arc;
use std::time::Duration;

use ingest::IngestConfig;
use serde::{Deserialize, Serialize};

use crate::accumulator::{AccumulatorConfig, WindowedAccumulator};
use crate::error::ConfigError;
use crate::fetch::HttpSnapshotSource;
use crate::orchestrator::Pipeline;
use crate::publish::{CsvLayout, PublishConfig, Publisher};
use crate::retry::RetryConfig;
use crate::scheduler::Scheduler;
use crate::storage::StorageConfig;
use crate::transform::{CommandRunner, TransformConfig, TransformTrigger};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Endpoint polled for position snapshots.
    ///
    /// Default: `https://dados.mobilidade.rio/gps/brt`
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Per-request network timeout, in seconds.
    ///
    /// Default: `60`
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Sleep after each cycle, in seconds.
    ///
    /// Default: `60`
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub accumulator: AccumulatorConfig,

    #[serde(default)]
    pub publish: PublishConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub transform: TransformConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            request_timeout_secs: default_request_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            retry: RetryConfig::default(),
            ingest: IngestConfig::default(),
            accumulator: AccumulatorConfig::default(),
            publish: PublishConfig::default(),
            storage: StorageConfig::default(),
            transform: TransformConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Check every section. Any error here is fatal at start-up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = reqwest::Url::parse(&self.api_url)
            .map_err(|e| ConfigError::invalid("api_url", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "api_url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "request_timeout_secs",
                "must be at least 1",
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "poll_interval_secs",
                "must be at least 1",
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::invalid(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }

        self.ingest.validate()?;
        self.accumulator.validate()?;
        self.publish.validate()?;
        self.storage.validate()?;
        self.transform.validate()?;
        Ok(())
    }

    /// Validate and assemble the production pipeline: HTTP source, configured
    /// storage backend and the transformation command.
    pub fn build_pipeline(&self) -> Result<Pipeline, ConfigError> {
        self.validate()?;

        let source = HttpSnapshotSource::new(&self.api_url, self.request_timeout())?
            .with_retry(self.retry);
        let accumulator =
            WindowedAccumulator::new(self.accumulator.clone(), self.ingest.target_timezone);
        let publisher = Publisher::new(
            self.storage.build()?,
            CsvLayout::from_ingest(&self.ingest),
            self.publish.clone(),
        );
        let trigger = TransformTrigger::new(Arc::new(CommandRunner::new(self.transform.clone())));

        Ok(Pipeline::new(
            Arc::new(source),
            self.ingest.clone(),
            accumulator,
            publisher,
            trigger,
        ))
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::fixed(self.poll_interval())
    }
}

fn default_api_url() -> String {
    "https://dados.mobilidade.rio/gps/brt".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_secs() -> u64 {
    60
}
