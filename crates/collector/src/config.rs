use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use transit_feed::PipelineConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "TRANSIT_FEED_CONFIG";
/// Prefix of environment overrides, e.g. `TRANSIT_FEED__PIPELINE__POLL_INTERVAL_SECS`.
pub const ENV_PREFIX: &str = "TRANSIT_FEED";

/// Collector process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// Run a single cycle and exit instead of looping.
    #[serde(default)]
    pub run_once: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            log: LogConfig::default(),
            run_once: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl CollectorConfig {
    /// Load configuration from the file named by `TRANSIT_FEED_CONFIG` (or
    /// `transit-feed.{yaml,toml,json}` in the working directory, if present),
    /// then apply `TRANSIT_FEED__*` environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("transit-feed").required(false),
        };

        let builder = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: CollectorConfig = builder.build()?.try_deserialize()?;
        config.pipeline.validate()?;
        Ok(config)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
