// =============================================================================
// Typed error taxonomy
// =============================================================================
//
// Every "exception" the external broker transport could raise collapses into
// `GatewayError`, classified once at the gateway boundary (see
// `broker::gateway`). `EngineError` is the broader failure type used by the
// control plane; it absorbs a `GatewayError` on the read path and adds the
// two failure modes that originate inside the core itself.
// =============================================================================

use thiserror::Error;

/// Failure classification for a single broker transport call.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("broker rejected the request: {reason}")]
    BrokerRejected { reason: String },

    #[error("malformed broker response: {detail}")]
    Malformed { detail: String },
}

/// Failure surfaced by the control plane. Every stage of the scheduler
/// returns this type so that a read-path gateway failure, an internal
/// invariant violation, and a shutdown request are all handled uniformly.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("invariant violated: {detail}")]
    Invariant { detail: String },

    #[error("shutdown requested")]
    Cancelled,
}

impl EngineError {
    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::Invariant {
            detail: detail.into(),
        }
    }

    /// Whether this failure should stop the scheduler outright. Anything
    /// reaching the control loop that isn't a gateway hiccup or a clean
    /// shutdown is a programmer error and must not be papered over.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Invariant { .. })
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
pub type EngineResult<T> = Result<T, EngineError>;
