//! Error taxonomy shared by every long-lived task and store.
//!
//! Kinds mirror the operational categories the pipeline distinguishes at
//! runtime (what to log, whether to retry, whether to surface a counter),
//! not Rust type hierarchies.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid configuration value (bad threshold, out-of-range bound).
    #[error("config error: {0}")]
    Config(String),

    /// A dependency (storage, exchange) is unreachable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Transient failure expected to resolve on retry (HTTP 5xx, dropped socket).
    #[error("transient error: {0}")]
    Transient(String),

    /// A uniqueness constraint was violated in a way upsert semantics did not resolve.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Malformed or non-finite numeric input, or a required feature missing.
    #[error("data error: {0}")]
    Data(String),

    /// A forbidden lifecycle transition or a checksum mismatch.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Transient(_) | PipelineError::Unavailable(_))
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Unavailable(e.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
