//! Error kinds for the adaptive query stage engine (spec.md §7).

use datafusion::error::DataFusionError;
use thiserror::Error;

/// Crate-wide result alias, mirroring `datafusion::error::Result`.
pub type Result<T> = std::result::Result<T, AqseError>;

#[derive(Debug, Error)]
pub enum AqseError {
    /// A plan-tree invariant was violated, e.g. a `ShuffleStage`'s child is
    /// not a shuffle exchange, or `execute()` was called on a broadcast
    /// stage. Fatal to the query; callers should propagate this unchanged.
    #[error("plan invariant violated: {0}")]
    PlanInvariantViolation(String),

    /// The exchange coordinator was given `MapOutputStatistics` that
    /// disagree on the pre-shuffle partition count `P`. Fatal.
    #[error("coordinator precondition failed: {0}")]
    CoordinatorPreconditionFailure(String),

    /// A child stage failed to execute; the parent must not cache a
    /// partial result and the host scheduler is expected to retry.
    #[error("stage execution failed: {0}")]
    ExecutionFailure(#[from] DataFusionError),

    /// A non-positive configuration value that spec.md §7 says to degrade
    /// rather than fail on (e.g. `targetPostShuffleInputSize`,
    /// `adaptiveSkewedSizeThreshold`). Never returned to a caller: the
    /// coordinator and the skew rewriter construct it only to log it via
    /// `warn!` and then recover with "disabled for this call" semantics.
    #[error("configuration value out of range: {0}")]
    ConfigurationRangeError(String),
}

impl AqseError {
    pub fn plan_invariant(msg: impl Into<String>) -> Self {
        AqseError::PlanInvariantViolation(msg.into())
    }

    pub fn coordinator_precondition(msg: impl Into<String>) -> Self {
        AqseError::CoordinatorPreconditionFailure(msg.into())
    }

    pub fn configuration_range(msg: impl Into<String>) -> Self {
        AqseError::ConfigurationRangeError(msg.into())
    }
}
