//! Core data model (spec §3): variant identity, spec, status, replica
//! metrics, and the decision record the analyzer produces.

use std::fmt;

use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::{CoreError, CoreResult};

fn variant_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^.+-[A-Za-z0-9_-]+-[1-9][0-9]*$").unwrap())
}

/// Target of the scaling action; only `Deployment` kinds are accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScaleTargetRef {
    pub kind: String,
    pub name: String,
}

/// Immutable-per-generation specification of one variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantSpec {
    /// Platform-compliant resource name (key into the VA cache, decision
    /// cache, and platform resource store).
    pub resource_name: String,
    /// Business variant id: `<modelID>-<accelerator>-<count>`.
    pub variant_id: String,
    pub namespace: String,
    pub scale_target_ref: ScaleTargetRef,
    pub model_id: String,
    pub accelerator: String,
    pub accelerator_count: u32,
    pub variant_cost: f64,
    /// Opaque to the core; only surfaced to the external optimizer path.
    pub performance_params: Option<serde_json::Value>,
}

impl VariantSpec {
    /// Validates the fields the platform itself would enforce (§6), used by
    /// the controller and by tests constructing specs directly rather than
    /// through a platform watch event.
    pub fn validate(&self) -> CoreResult<()> {
        if self.scale_target_ref.kind != "Deployment" {
            return Err(CoreError::InvalidConfiguration(format!(
                "scaleTargetRef.kind must be Deployment, got {}",
                self.scale_target_ref.kind
            )));
        }
        if self.scale_target_ref.name.is_empty() {
            return Err(CoreError::InvalidConfiguration(
                "scaleTargetRef.name must be non-empty".into(),
            ));
        }
        if self.model_id.is_empty() || self.model_id.len() > 128 {
            return Err(CoreError::InvalidConfiguration(format!(
                "modelID length out of range: {}",
                self.model_id.len()
            )));
        }
        if self.accelerator.is_empty() || self.accelerator.len() > 64 {
            return Err(CoreError::InvalidConfiguration(format!(
                "accelerator length out of range: {}",
                self.accelerator.len()
            )));
        }
        if self.accelerator_count < 1 {
            return Err(CoreError::InvalidConfiguration(
                "acceleratorCount must be >= 1".into(),
            ));
        }
        if self.variant_cost < 0.0 {
            return Err(CoreError::InvalidConfiguration(
                "variantCost must be >= 0".into(),
            ));
        }
        if !variant_id_re().is_match(&self.variant_id) {
            return Err(CoreError::InvalidConfiguration(format!(
                "variant id {} does not match <modelID>-<accelerator>-<count>",
                self.variant_id
            )));
        }
        Ok(())
    }

    pub fn default_cost() -> f64 {
        10.0
    }
}

/// Current allocation as last observed from the platform (§3 VariantStatus).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CurrentAlloc {
    pub num_replicas: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastUpdate {
    pub update_time: DateTime<Utc>,
    pub num_replicas_changed: i32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesiredOptimizedAlloc {
    pub last_run_time: DateTime<Utc>,
    pub num_replicas: u32,
    pub last_update: LastUpdate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Actuation {
    pub applied: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConditionType {
    MetricsAvailable,
    OptimizationReady,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionType::MetricsAvailable => write!(f, "MetricsAvailable"),
            ConditionType::OptimizationReady => write!(f, "OptimizationReady"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Status subresource, written only by the reconciliation controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VariantStatus {
    pub current_alloc: CurrentAlloc,
    pub desired_optimized_alloc: Option<DesiredOptimizedAlloc>,
    pub actuation: Actuation,
    pub conditions: Vec<Condition>,
}

impl VariantStatus {
    pub fn set_condition(&mut self, condition_type: ConditionType, status: ConditionStatus, reason: &str, message: &str, now: DateTime<Utc>) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.condition_type == condition_type) {
            if existing.status != status || existing.reason != reason {
                existing.last_transition_time = now;
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
        } else {
            self.conditions.push(Condition {
                condition_type,
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
            });
        }
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.condition_type == condition_type)
    }
}

/// A per-replica observation from the serving engine, as pulled through the
/// metrics collector facade (C5).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicaMetrics {
    pub replica_id: String,
    /// Fraction of KV-cache in use, clamped to `[0, 1]` on construction.
    pub kv_cache_usage: f64,
    pub queue_length: u32,
    pub variant_cost: f64,
    pub accelerator_name: String,
    /// Pod exists but has not yet reported metrics.
    pub pending: bool,
}

impl ReplicaMetrics {
    pub fn new(replica_id: impl Into<String>, kv_cache_usage: f64, queue_length: u32, variant_cost: f64, accelerator_name: impl Into<String>, pending: bool) -> Self {
        Self {
            replica_id: replica_id.into(),
            kv_cache_usage: kv_cache_usage.clamp(0.0, 1.0),
            queue_length,
            variant_cost,
            accelerator_name: accelerator_name.into(),
            pending,
        }
    }
}

/// The observed allocation (ready/total replica counts) for a variant,
/// returned by `CollectAllocation` (C5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Allocation {
    pub total_replicas: u32,
    pub ready_replicas: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DecisionAction {
    ScaleUp,
    ScaleDown,
    Hold,
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionAction::ScaleUp => write!(f, "scale-up"),
            DecisionAction::ScaleDown => write!(f, "scale-down"),
            DecisionAction::Hold => write!(f, "hold"),
        }
    }
}

/// The analyzer's (C7) output for one variant, cached by the engine (C9) and
/// consumed by the controller (C10).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantDecision {
    pub variant_name: String,
    pub namespace: String,
    pub target_replicas: u32,
    pub accelerator_name: String,
    pub action: DecisionAction,
    pub reason: String,
}

/// Resource key used to index the VA cache and decision cache: `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey(pub String);

impl ResourceKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self(format!("{namespace}/{name}"))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_spec() -> VariantSpec {
        VariantSpec {
            resource_name: "m1-a100-2".into(),
            variant_id: "m1-a100-2".into(),
            namespace: "default".into(),
            scale_target_ref: ScaleTargetRef { kind: "Deployment".into(), name: "m1-a100-2".into() },
            model_id: "m1".into(),
            accelerator: "a100".into(),
            accelerator_count: 2,
            variant_cost: 10.0,
            performance_params: None,
        }
    }

    #[test]
    fn validate_accepts_well_formed_spec() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn validate_rejects_non_deployment_target() {
        let mut s = valid_spec();
        s.scale_target_ref.kind = "StatefulSet".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_malformed_variant_id() {
        let mut s = valid_spec();
        s.variant_id = "not-a-valid-id".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn set_condition_advances_transition_time_only_on_change() {
        let mut status = VariantStatus::default();
        let t0 = Utc::now();
        status.set_condition(ConditionType::MetricsAvailable, ConditionStatus::True, "Fresh", "ok", t0);
        let first = status.condition(ConditionType::MetricsAvailable).unwrap().last_transition_time;
        let t1 = t0 + chrono::Duration::seconds(30);
        status.set_condition(ConditionType::MetricsAvailable, ConditionStatus::True, "Fresh", "ok", t1);
        let second = status.condition(ConditionType::MetricsAvailable).unwrap().last_transition_time;
        assert_eq!(first, second);
        let t2 = t1 + chrono::Duration::seconds(30);
        status.set_condition(ConditionType::MetricsAvailable, ConditionStatus::False, "MetricsMissing", "gone", t2);
        let third = status.condition(ConditionType::MetricsAvailable).unwrap().last_transition_time;
        assert_eq!(third, t2);
    }
}
