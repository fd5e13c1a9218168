//! Running the downstream transformation after a successful publish.
//!
//! The transformation itself is an external tool (a `dbt run` by default) that
//! rebuilds warehouse models from the staged files. This module only decides
//! *whether* it runs and reports how it went.
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, StageError, StageResult, TransformError};
use crate::publish::PublishAck;

const MAX_OUTPUT_LEN: usize = 16 * 1024;

/// Something that can run the transformation once.
#[async_trait]
pub trait TransformRunner: Send + Sync {
    /// Run to completion. Returns captured standard output on success.
    async fn run(&self) -> Result<String, TransformError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Default: `"dbt"`
    #[serde(default = "default_program")]
    pub program: String,

    /// Default: `["run"]`
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Passed as `--project-dir`.
    ///
    /// Default: `./dbt/transit_project`
    #[serde(default = "default_project_dir")]
    pub project_dir: PathBuf,

    /// Passed as `--profiles-dir`.
    ///
    /// Default: `./dbt`
    #[serde(default = "default_profiles_dir")]
    pub profiles_dir: PathBuf,

    /// Kill the process if it runs longer than this. Unlimited when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            project_dir: default_project_dir(),
            profiles_dir: default_profiles_dir(),
            timeout_secs: None,
        }
    }
}

impl TransformConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.program.trim().is_empty() {
            return Err(ConfigError::invalid("transform.program", "must not be empty"));
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::invalid(
                "transform.timeout_secs",
                "must be at least 1 when set",
            ));
        }
        Ok(())
    }
}

/// Runs the configured program as a child process.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    cfg: TransformConfig,
}

impl CommandRunner {
    pub fn new(cfg: TransformConfig) -> Self {
        Self { cfg }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.cfg.program);
        cmd.args(&self.cfg.args)
            .arg("--project-dir")
            .arg(&self.cfg.project_dir)
            .arg("--profiles-dir")
            .arg(&self.cfg.profiles_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl TransformRunner for CommandRunner {
    async fn run(&self) -> Result<String, TransformError> {
        let program = self.cfg.program.clone();
        let output = self.command().output();

        let output = match self.cfg.timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), output)
                .await
                .map_err(|_| TransformError::Timeout {
                    program: program.clone(),
                    secs,
                })?,
            None => output.await,
        }
        .map_err(|e| TransformError::Invocation {
            program: program.clone(),
            message: e.to_string(),
        })?;

        let stdout = truncate(String::from_utf8_lossy(&output.stdout).into_owned());
        let stderr = truncate(String::from_utf8_lossy(&output.stderr).into_owned());

        if output.status.success() {
            Ok(stdout)
        } else {
            Err(TransformError::Failed {
                code: output.status.code(),
                stdout,
                stderr,
            })
        }
    }
}

/// Successful transformation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformAck {
    pub stdout: String,
    pub elapsed: Duration,
}

/// Gate in front of a [`TransformRunner`]: runs it only after a successful
/// publish.
pub struct TransformTrigger {
    runner: Arc<dyn TransformRunner>,
}

impl TransformTrigger {
    pub fn new(runner: Arc<dyn TransformRunner>) -> Self {
        Self { runner }
    }

    /// An upstream error short-circuits into [`StageError::Skipped`] without
    /// invoking the runner.
    pub async fn trigger(&self, upstream: StageResult<PublishAck>) -> StageResult<TransformAck> {
        let ack = match upstream {
            Ok(ack) => ack,
            Err(err) => {
                debug!(reason = %err, "transform_skipped");
                return Err(StageError::Skipped(Box::new(err)));
            }
        };

        let start = Instant::now();
        match self.runner.run().await {
            Ok(stdout) => {
                let elapsed = start.elapsed();
                info!(
                    key = %ack.key,
                    elapsed_micros = elapsed.as_micros() as u64,
                    "transform_success"
                );
                debug!(stdout = %stdout, "transform_output");
                Ok(TransformAck { stdout, elapsed })
            }
            Err(err) => {
                warn!(
                    key = %ack.key,
                    error = %err,
                    elapsed_micros = start.elapsed().as_micros() as u64,
                    "transform_failure"
                );
                Err(err.into())
            }
        }
    }
}

fn truncate(mut text: String) -> String {
    if text.len() <= MAX_OUTPUT_LEN {
        return text;
    }
    let mut end = MAX_OUTPUT_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str("...[truncated]");
    text
}

fn default_program() -> String {
    "dbt".to_string()
}

fn default_args() -> Vec<String> {
    vec!["run".to_string()]
}

fn default_project_dir() -> PathBuf {
    PathBuf::from("./dbt/transit_project")
}

fn default_profiles_dir() -> PathBuf {
    PathBuf::from("./dbt")
}
