//! Error types for the pipeline stages.
//!
//! Every stage returns a [`StageResult`]. Failures are values: a stage that
//! receives an upstream error forwards it (or a derived error) without running
//! its own side effects, so nothing escapes the cycle as a panic.
//!
//! | Error | Stage | Fatal |
//! |-------|-------|-------|
//! | [`FetchError`] | fetch | no |
//! | [`IngestError`] | normalize | no |
//! | [`StageError::NoData`] | publish (nothing consolidated) | no, idle |
//! | [`PublishError`] | publish | no |
//! | [`StageError::Skipped`] | transform gate | no |
//! | [`TransformError`] | transform | no |
//! | [`ConfigError`] | start-up | yes |
use ingest::IngestError;
use thiserror::Error;

/// Result passed from one stage to the next.
pub type StageResult<T> = Result<T, StageError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("normalization failed: {0}")]
    Normalization(#[from] IngestError),

    /// The accumulator did not produce a consolidated batch this cycle.
    #[error("no data")]
    NoData,

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    /// The transform gate did not open because publishing was skipped or
    /// failed; carries the publish stage's error.
    #[error("publish skipped or failed: {0}")]
    Skipped(Box<StageError>),

    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),
}

impl StageError {
    /// `true` when the cycle simply had nothing to do.
    pub fn is_idle(&self) -> bool {
        match self {
            StageError::NoData => true,
            StageError::Skipped(inner) => inner.is_idle(),
            _ => false,
        }
    }

    /// Name of the stage that produced the error, for log fields.
    pub fn stage(&self) -> &'static str {
        match self {
            StageError::Fetch(_) => "fetch",
            StageError::Normalization(_) => "normalize",
            StageError::NoData => "accumulate",
            StageError::Publish(_) => "publish",
            StageError::Skipped(_) | StageError::Transform(_) => "transform",
        }
    }

    /// The innermost error when this one wraps a skipped upstream stage.
    pub fn root_cause(&self) -> &StageError {
        match self {
            StageError::Skipped(inner) => inner.root_cause(),
            other => other,
        }
    }
}

/// Failures while polling the position feed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FetchError {
    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("response is not valid JSON: {0}")]
    Decode(String),
}

impl FetchError {
    /// Timeouts, transport faults, throttling and server errors may succeed on
    /// a later attempt; decode failures and client errors will not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Transport(_) => true,
            FetchError::Status(code) => *code == 429 || *code >= 500,
            FetchError::Decode(_) => false,
        }
    }
}

/// Failures while writing a consolidated batch to storage.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PublishError {
    #[error("failed to encode batch: {0}")]
    Encode(String),

    #[error("storage write to '{key}' failed: {message}")]
    Storage { key: String, message: String },

    /// No bearer token could be obtained for the storage backend.
    #[error("failed to obtain storage credentials: {0}")]
    Auth(String),
}

/// Failures of the external transformation tool.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransformError {
    /// The process could not be started at all.
    #[error("failed to invoke '{program}': {message}")]
    Invocation { program: String, message: String },

    #[error("'{program}' did not finish within {secs}s")]
    Timeout { program: String, secs: u64 },

    /// The process ran and exited unsuccessfully.
    #[error("exited with status {code:?}\nstdout: {stdout}\nstderr: {stderr}")]
    Failed {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

/// Invalid configuration detected at start-up. The only fatal error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error(transparent)]
    Ingest(#[from] ingest::ConfigError),

    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}
