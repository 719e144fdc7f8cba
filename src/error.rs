//! Error taxonomy for the autoscaling decision core.
//!
//! Variants are organized by cause (see spec §7), not by the subsystem that
//! raised them, so that the controller can map a single enum onto the two
//! condition types it writes (`MetricsAvailable`, `OptimizationReady`).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("metrics missing for {0}")]
    MetricsMissing(String),

    #[error("metrics stale for {0}: last fetch {1:?} old")]
    MetricsStale(String, std::time::Duration),

    #[error("metrics source error: {0}")]
    SourceError(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("optimization skipped: {0}")]
    OptimizationSkipped(String),

    #[error("actuation failed for {0}: {1}")]
    ActuationError(String, String),

    #[error("transient platform error for {0}: {1}")]
    PlatformTransient(String, String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Maps this error onto the reason string recorded in `lastUpdate.reason`
    /// or a condition's `reason` field (spec §7 "every decision has a reason").
    pub fn reason(&self) -> &'static str {
        match self {
            CoreError::MetricsMissing(_) => "MetricsMissing",
            CoreError::MetricsStale(_, _) => "MetricsStale",
            CoreError::SourceError(_) => "PrometheusError",
            CoreError::InvalidConfiguration(_) => "InvalidConfiguration",
            CoreError::OptimizationSkipped(_) => "OptimizationSkipped",
            CoreError::ActuationError(_, _) => "ActuationError",
            CoreError::PlatformTransient(_, _) => "TransientPlatformError",
            CoreError::Internal(_) => "InternalError",
        }
    }

    /// Which condition type (spec §7) this error should be surfaced under.
    pub fn condition_type(&self) -> super::types::ConditionType {
        use super::types::ConditionType;
        match self {
            CoreError::MetricsMissing(_) | CoreError::MetricsStale(_, _) | CoreError::SourceError(_) => {
                ConditionType::MetricsAvailable
            }
            _ => ConditionType::OptimizationReady,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
