//! Reconciliation controller (spec §4.10, C10): the only writer of
//! `VariantStatus` and the only caller of `PlatformClient::set_scale_target_replicas`.
//! Consumes `DecisionTrigger` events for low-latency reaction and runs a
//! periodic full sweep as a catch-all, mirroring the teacher's
//! `Controller` trait / event-queue dispatch in `controller_manager.rs`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::engine::decision_or_hold;
use crate::metrics_sink::MetricsSink;
use crate::platform::PlatformClient;
use crate::state::SharedState;
use crate::types::{Actuation, ConditionStatus, ConditionType, CurrentAlloc, DecisionAction, DesiredOptimizedAlloc, LastUpdate, ResourceKey, VariantStatus};

const DEFAULT_FULL_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Derives the `MetricsAvailable` condition from the decision's own reason
/// string (spec §7: the collector collapses SourceError/MetricsMissing into
/// absence, the analyzer surfaces that as a hold reasoned `MetricsUnavailable`,
/// and the controller must in turn surface `MetricsAvailable=False`). A
/// decision with no metrics-related reason keeps the condition `True`; a
/// decision that hasn't been computed yet (engine has not run a cycle for
/// this model) is `Unknown` rather than `False`, since absence of a decision
/// is not itself evidence that metrics are unavailable.
fn metrics_condition(decision_reason: &str) -> (ConditionStatus, &'static str, String) {
    if let Some(detail) = decision_reason.strip_prefix("MetricsUnavailable: ") {
        (ConditionStatus::False, "MetricsMissing", detail.to_string())
    } else if let Some(detail) = decision_reason.strip_prefix("OptimizationPending: ") {
        (ConditionStatus::Unknown, "OptimizationPending", detail.to_string())
    } else {
        (ConditionStatus::True, "MetricsAvailable", "metrics collected within freshness window".to_string())
    }
}

#[derive(Default)]
pub struct ControllerMetrics {
    pub reconciles: std::sync::atomic::AtomicU64,
    pub actuations_applied: std::sync::atomic::AtomicU64,
    pub actuations_failed: std::sync::atomic::AtomicU64,
    pub conflicts_arbitrated: std::sync::atomic::AtomicU64,
}

pub struct ReconciliationController {
    state: Arc<SharedState>,
    platform: Arc<dyn PlatformClient>,
    sink: Arc<MetricsSink>,
    full_sweep_interval: Duration,
    /// Last status written per variant, kept locally since `PlatformClient`
    /// is write-only for status (spec §6): needed so `set_condition` can
    /// tell whether a condition actually changed before advancing its
    /// `last_transition_time`.
    last_status: Mutex<HashMap<ResourceKey, VariantStatus>>,
    pub metrics: Arc<ControllerMetrics>,
}

impl ReconciliationController {
    pub fn new(state: Arc<SharedState>, platform: Arc<dyn PlatformClient>, sink: Arc<MetricsSink>) -> Self {
        Self { state, platform, sink, full_sweep_interval: DEFAULT_FULL_SWEEP_INTERVAL, last_status: Mutex::new(HashMap::new()), metrics: Arc::new(ControllerMetrics::default()) }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(self.full_sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.state.recv_trigger() => {
                    match event {
                        Some(ev) => {
                            let key = ResourceKey::new(&ev.namespace, &ev.name);
                            if let Err(e) = self.reconcile_discovered(&key).await {
                                error!(%key, error = %e, "reconcile from trigger failed");
                            }
                        }
                        None => return,
                    }
                }
                _ = sweep.tick() => {
                    self.reconcile_all().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Reconciles every variant currently known to the platform, discovering
    /// new/removed variants and arbitrating scale-target conflicts across
    /// the whole set before actuating any of them.
    pub async fn reconcile_all(&self) {
        let live = match self.platform.list_ready_variants().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to list variants from platform, skipping full sweep");
                return;
            }
        };

        let live_keys: Vec<ResourceKey> = live.iter().map(|v| ResourceKey::new(&v.namespace, &v.resource_name)).collect();

        for (key, entry) in self.state.get_ready_vas() {
            if !live_keys.contains(&key) {
                self.state.evict_variant(&key);
                self.last_status.lock().unwrap().remove(&key);
                info!(%key, "evicted variant no longer present on platform");
                let _ = entry;
            }
        }

        for spec in &live {
            let key = ResourceKey::new(&spec.namespace, &spec.resource_name);
            if let Err(e) = spec.validate() {
                warn!(%key, error = %e, "dropping variant with invalid spec");
                continue;
            }
            let current = match self.platform.get_scale_target_replicas(&spec.scale_target_ref, &spec.namespace).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(%key, error = %e, "failed to read current replicas, skipping");
                    continue;
                }
            };
            self.state.upsert_variant(key, spec.clone(), current);
        }

        // Conflict arbitration: multiple variants sharing one scale target
        // within a namespace. Lower-lexicographic resource key wins; losers
        // are never actuated and get an InvalidConfiguration condition.
        let mut by_target: HashMap<(String, String), Vec<ResourceKey>> = HashMap::new();
        for (key, entry) in self.state.get_ready_vas() {
            by_target.entry((entry.spec.namespace.clone(), entry.spec.scale_target_ref.name.clone())).or_default().push(key);
        }

        let mut losers: std::collections::HashSet<ResourceKey> = std::collections::HashSet::new();
        for (_, mut keys) in by_target {
            if keys.len() < 2 {
                continue;
            }
            keys.sort();
            self.metrics.conflicts_arbitrated.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            for loser in &keys[1..] {
                losers.insert(loser.clone());
            }
        }

        for key in live_keys {
            let is_loser = losers.contains(&key);
            if let Err(e) = self.reconcile_one(&key, is_loser).await {
                error!(%key, error = %e, "reconcile failed");
            }
        }
    }

    /// Reconciles a single variant discovered via a trigger event: re-reads
    /// its spec so a since-deleted variant is evicted promptly rather than
    /// waiting for the next full sweep.
    async fn reconcile_discovered(&self, key: &ResourceKey) -> Result<(), String> {
        match self.platform.get_variant(key).await.map_err(|e| e.to_string())? {
            None => {
                self.state.evict_variant(key);
                self.last_status.lock().unwrap().remove(key);
                Ok(())
            }
            Some(spec) => {
                let current = self.platform.get_scale_target_replicas(&spec.scale_target_ref, &spec.namespace).await.map_err(|e| e.to_string())?;
                self.state.upsert_variant(key.clone(), spec, current);
                self.reconcile_one(key, false).await
            }
        }
    }

    async fn reconcile_one(&self, key: &ResourceKey, is_conflict_loser: bool) -> Result<(), String> {
        self.metrics.reconciles.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let Some(entry) = self.state.get_variant(key) else { return Ok(()) };
        let now = Utc::now();

        let mut status = self.last_status.lock().unwrap().get(key).cloned().unwrap_or_default();
        status.current_alloc = CurrentAlloc { num_replicas: entry.current_replicas };

        if is_conflict_loser {
            status.set_condition(
                ConditionType::OptimizationReady,
                ConditionStatus::False,
                "InvalidConfiguration",
                "scaleTargetRef conflicts with another variant; not actuated",
                now,
            );
            self.platform.write_variant_status(key, status.clone()).await.map_err(|e| e.to_string())?;
            self.last_status.lock().unwrap().insert(key.clone(), status);
            return Ok(());
        }

        let decision = decision_or_hold(&self.state, key, entry.current_replicas, &entry.spec.accelerator);

        let prev_desired = status.desired_optimized_alloc.clone();
        let reason_or_num_changed = prev_desired
            .as_ref()
            .map(|p| p.num_replicas != decision.target_replicas || p.last_update.reason != decision.reason)
            .unwrap_or(true);

        let last_update = if reason_or_num_changed {
            LastUpdate { update_time: now, num_replicas_changed: decision.target_replicas as i32 - entry.current_replicas as i32, reason: decision.reason.clone() }
        } else {
            prev_desired.as_ref().map(|p| p.last_update.clone()).unwrap_or(LastUpdate { update_time: now, num_replicas_changed: 0, reason: decision.reason.clone() })
        };

        status.desired_optimized_alloc = Some(DesiredOptimizedAlloc { last_run_time: now, num_replicas: decision.target_replicas, last_update });

        let (metrics_status, metrics_reason, metrics_message) = metrics_condition(&decision.reason);
        status.set_condition(ConditionType::MetricsAvailable, metrics_status, metrics_reason, &metrics_message, now);

        if decision.target_replicas != entry.current_replicas {
            match self.platform.set_scale_target_replicas(&entry.spec.scale_target_ref, &entry.spec.namespace, decision.target_replicas).await {
                Ok(()) => {
                    status.actuation = Actuation { applied: true };
                    status.set_condition(ConditionType::OptimizationReady, ConditionStatus::True, "OptimizationReady", "actuation applied", now);
                    self.metrics.actuations_applied.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let direction = if decision.target_replicas > entry.current_replicas { "up" } else { "down" };
                    self.sink.record_scaling(&entry.spec.resource_name, &entry.spec.namespace, &entry.spec.accelerator, direction, decision.reason.as_str());
                }
                Err(e) => {
                    status.actuation = Actuation { applied: false };
                    status.set_condition(ConditionType::OptimizationReady, ConditionStatus::False, e.reason(), &e.to_string(), now);
                    self.metrics.actuations_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        } else {
            status.actuation = Actuation { applied: false };
            status.set_condition(ConditionType::OptimizationReady, ConditionStatus::True, "OptimizationReady", "already at target replica count", now);
        }

        self.sink.observe(&entry.spec.resource_name, &entry.spec.namespace, &entry.spec.accelerator, decision.target_replicas, entry.current_replicas);

        self.platform.write_variant_status(key, status.clone()).await.map_err(|e| e.to_string())?;
        self.last_status.lock().unwrap().insert(key.clone(), status);

        if decision.action != DecisionAction::Hold {
            info!(%key, action = %decision.action, target = decision.target_replicas, "actuated scaling decision");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelScalingConfigMap;
    use crate::platform::FakePlatformClient;
    use crate::state::GlobalConfig;
    use crate::types::{ScaleTargetRef, VariantSpec};
    use std::collections::BTreeMap as Map;

    fn spec(name: &str, target: &str) -> VariantSpec {
        VariantSpec {
            resource_name: name.into(),
            variant_id: format!("{name}-a100-1"),
            namespace: "ns".into(),
            scale_target_ref: ScaleTargetRef { kind: "Deployment".into(), name: target.into() },
            model_id: "m1".into(),
            accelerator: "a100".into(),
            accelerator_count: 1,
            variant_cost: 10.0,
            performance_params: None,
        }
    }

    fn state() -> Arc<SharedState> {
        Arc::new(SharedState::new(GlobalConfig { optimization_interval: Duration::from_secs(30), model_scaling: Arc::new(ModelScalingConfigMap::parse(&Map::new())) }))
    }

    #[tokio::test]
    async fn reconcile_all_actuates_when_decision_differs() {
        let st = state();
        let platform = Arc::new(FakePlatformClient::new());
        let key = ResourceKey::new("ns", "v1");
        platform.put_variant(key.clone(), spec("v1", "v1"));
        platform.set_deployment_replicas("ns", "v1", 2);
        st.set_decision(
            key.clone(),
            crate::types::VariantDecision { variant_name: "v1".into(), namespace: "ns".into(), target_replicas: 3, accelerator_name: "a100".into(), action: DecisionAction::ScaleUp, reason: "x".into() },
        );

        let sink = Arc::new(MetricsSink::new());
        let controller = ReconciliationController::new(st.clone(), platform.clone(), sink);
        controller.reconcile_all().await;

        assert_eq!(platform.get_scale_target_replicas(&spec("v1", "v1").scale_target_ref, "ns").await.unwrap(), 3);
        let status = platform.get_status(&key).unwrap();
        assert!(status.actuation.applied);
    }

    #[tokio::test]
    async fn conflicting_scale_targets_only_one_actuates() {
        let st = state();
        let platform = Arc::new(FakePlatformClient::new());
        let key_a = ResourceKey::new("ns", "a-variant");
        let key_b = ResourceKey::new("ns", "b-variant");
        platform.put_variant(key_a.clone(), spec("a-variant", "shared"));
        platform.put_variant(key_b.clone(), spec("b-variant", "shared"));
        platform.set_deployment_replicas("ns", "shared", 2);

        st.set_decision(
            key_a.clone(),
            crate::types::VariantDecision { variant_name: "a-variant".into(), namespace: "ns".into(), target_replicas: 3, accelerator_name: "a100".into(), action: DecisionAction::ScaleUp, reason: "x".into() },
        );
        st.set_decision(
            key_b.clone(),
            crate::types::VariantDecision { variant_name: "b-variant".into(), namespace: "ns".into(), target_replicas: 5, accelerator_name: "a100".into(), action: DecisionAction::ScaleUp, reason: "y".into() },
        );

        let sink = Arc::new(MetricsSink::new());
        let controller = ReconciliationController::new(st.clone(), platform.clone(), sink);
        controller.reconcile_all().await;

        let status_a = platform.get_status(&key_a).unwrap();
        let status_b = platform.get_status(&key_b).unwrap();
        assert!(status_a.actuation.applied);
        assert!(!status_b.actuation.applied);
        assert_eq!(status_b.condition(ConditionType::OptimizationReady).unwrap().reason, "InvalidConfiguration");
    }

    #[tokio::test]
    async fn evicted_variant_is_removed_from_va_cache() {
        let st = state();
        let platform = Arc::new(FakePlatformClient::new());
        let key = ResourceKey::new("ns", "v1");
        platform.put_variant(key.clone(), spec("v1", "v1"));
        platform.set_deployment_replicas("ns", "v1", 1);

        let sink = Arc::new(MetricsSink::new());
        let controller = ReconciliationController::new(st.clone(), platform.clone(), sink);
        controller.reconcile_all().await;
        assert!(st.get_variant(&key).is_some());

        platform.remove_variant(&key);
        controller.reconcile_all().await;
        assert!(st.get_variant(&key).is_none());
    }

    #[tokio::test]
    async fn metrics_unavailable_decision_surfaces_metrics_available_false() {
        let st = state();
        let platform = Arc::new(FakePlatformClient::new());
        let key = ResourceKey::new("ns", "v1");
        platform.put_variant(key.clone(), spec("v1", "v1"));
        platform.set_deployment_replicas("ns", "v1", 2);
        st.set_decision(
            key.clone(),
            crate::types::VariantDecision {
                variant_name: "v1".into(),
                namespace: "ns".into(),
                target_replicas: 2,
                accelerator_name: "a100".into(),
                action: DecisionAction::Hold,
                reason: "MetricsUnavailable: no non-saturated or pending replicas observed".into(),
            },
        );

        let sink = Arc::new(MetricsSink::new());
        let controller = ReconciliationController::new(st.clone(), platform.clone(), sink);
        controller.reconcile_all().await;

        let status = platform.get_status(&key).unwrap();
        let condition = status.condition(ConditionType::MetricsAvailable).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, "MetricsMissing");
    }

    #[tokio::test]
    async fn pending_decision_surfaces_metrics_available_unknown() {
        let st = state();
        let platform = Arc::new(FakePlatformClient::new());
        let key = ResourceKey::new("ns", "v1");
        platform.put_variant(key.clone(), spec("v1", "v1"));
        platform.set_deployment_replicas("ns", "v1", 2);
        // No decision written: reconcile falls back through `decision_or_hold`.

        let sink = Arc::new(MetricsSink::new());
        let controller = ReconciliationController::new(st.clone(), platform.clone(), sink);
        controller.reconcile_all().await;

        let status = platform.get_status(&key).unwrap();
        let condition = status.condition(ConditionType::MetricsAvailable).unwrap();
        assert_eq!(condition.status, ConditionStatus::Unknown);
        assert_eq!(condition.reason, "OptimizationPending");
    }
}
