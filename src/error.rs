//! Error taxonomy for the reconciliation engine.
//!
//! Per-record and per-operation errors are caught at the reconciler boundary
//! and aggregated into reports. Only [`SyncError::Config`] and a wholly
//! unreachable destination escape [`Pipeline::run`](crate::pipeline::Pipeline::run).
//!
//! A stale identity mapping is not an error: the reconciler purges it,
//! logs the inconsistency and treats the record as new.

use thiserror::Error;

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A required credential or identifier is missing. Fatal, raised before
    /// any remote call.
    #[error("configuration error: {0}")]
    Config(String),

    /// Non-retryable non-2xx response from a remote store.
    #[error("remote error {status}: {body}")]
    Remote { status: u16, body: String },

    /// HTTP 429 persisted past the retry ceiling.
    #[error("rate limit still exceeded after {attempts} attempt(s)")]
    RateLimitExhausted { attempts: u32 },

    /// 5xx, network or timeout failures persisted past the retry ceiling.
    #[error("transient failure after {attempts} attempt(s): {message}")]
    Transient { attempts: u32, message: String },

    /// A source record could not be projected into destination fields.
    #[error("projection failed for {source_id}: {message}")]
    Projection { source_id: String, message: String },

    /// The source store returned something the engine cannot read.
    #[error("source store error: {0}")]
    Source(String),

    /// Persisting or loading reconciliation state failed.
    #[error("state persistence error: {0}")]
    State(String),
}

/// Result alias used across the library.
pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Whether the error is a 404 from a remote store.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Remote { status: 404, .. })
    }

    /// Whether the error came from exhausting the rate-limit budget.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SyncError::RateLimitExhausted { .. })
    }

    /// Short machine-readable kind, used in progress events and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Config(_) => "config",
            SyncError::Remote { .. } => "remote",
            SyncError::RateLimitExhausted { .. } => "rate_limit_exhausted",
            SyncError::Transient { .. } => "transient",
            SyncError::Projection { .. } => "projection",
            SyncError::Source(_) => "source",
            SyncError::State(_) => "state",
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::State(err.to_string())
    }
}
