//! Error types produced by the ingest crate.
//!
//! Normalization never panics on bad input: every malformed payload surfaces as
//! an [`IngestError`] so the pipeline can forward it as a stage failure.
//!
//! | Error | Description |
//! |-------|-------------|
//! | [`MalformedPayload`](IngestError::MalformedPayload) | Payload is neither an entry array nor an object holding one |
//! | [`InvalidTimestamp`](IngestError::InvalidTimestamp) | GPS timestamp is not epoch milliseconds or is out of range |
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IngestError {
    /// The snapshot payload does not have a recognizable entry sequence.
    ///
    /// ```rust
    /// use ingest::IngestError;
    ///
    /// let err = IngestError::MalformedPayload("expected an array".into());
    /// assert!(err.to_string().contains("malformed payload"));
    /// ```
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A GPS timestamp could not be interpreted as epoch milliseconds.
    #[error("invalid timestamp in field '{field}': {value}")]
    InvalidTimestamp { field: String, value: String },
}

impl IngestError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        IngestError::MalformedPayload(message.into())
    }
}
