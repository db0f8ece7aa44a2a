//! Error kinds shared across the spool, sinks, retry policy, and breaker.
//!
//! Mirrors spec §7: each variant is a distinct treatment path, not just a
//! distinct cause. Callers match on kind, not on message text.

use thiserror::Error;

/// A classified error as it crosses a component boundary.
#[derive(Debug, Error)]
pub enum EdgeBotError {
    /// The spool would exceed `max_bytes`; caller must drop or degrade.
    #[error("spool capacity exceeded")]
    CapacityExceeded,

    /// Local storage I/O failed; treated as transient by the shipper.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Network error, timeout, or a retryable HTTP status.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Non-retryable: 4xx (except 429), TLS failure, serialization error,
    /// ENOSPC on the file sink.
    #[error("permanent send failure: {0}")]
    Permanent(String),

    /// Rejected by a circuit breaker in `open` or saturated `half_open`.
    #[error("circuit open")]
    CircuitOpen,

    /// Clean shutdown requested mid-operation.
    #[error("cancelled")]
    Cancelled,

    /// Configuration failed to parse or validate.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EdgeBotError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EdgeBotError::Transient(_) | EdgeBotError::Unavailable(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, EdgeBotError::Permanent(_))
    }
}
