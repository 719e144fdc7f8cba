//! Optimization engine driver (spec §4.9, C9): the periodic tick that groups
//! tracked variants by model, pulls pooled replica metrics through the
//! collector, hands them to the analyzer, and writes the resulting decisions
//! back into shared state. Structured as a `tokio::select!` worker loop over
//! an `interval` and a shutdown watch, matching the teacher's
//! `run_reconciliation_loop` shape in `controller_manager.rs`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::analyzer::{self, VariantState};
use crate::collector::MetricsCollector;
use crate::state::{DecisionTriggerEvent, SharedState};
use crate::types::{DecisionAction, ResourceKey, VariantDecision, VariantSpec};

#[derive(Default)]
pub struct EngineMetrics {
    pub cycles: std::sync::atomic::AtomicU64,
    pub decisions_written: std::sync::atomic::AtomicU64,
    pub models_skipped: std::sync::atomic::AtomicU64,
}

/// Drives one optimization cycle per `optimization_interval`. Owns no state
/// beyond the handles it was built with; every read/write goes through
/// `SharedState` and the collector facade so the controller worker observes
/// a consistent view.
pub struct OptimizationEngine {
    state: Arc<SharedState>,
    collector: Arc<MetricsCollector>,
    pub metrics: Arc<EngineMetrics>,
}

impl OptimizationEngine {
    pub fn new(state: Arc<SharedState>, collector: Arc<MetricsCollector>) -> Self {
        Self { state, collector, metrics: Arc::new(EngineMetrics::default()) }
    }

    /// Runs until `shutdown` reports `true`. A zero-duration
    /// `optimization_interval` disables the loop entirely, mirroring the
    /// fetcher's "interval of zero means disabled" convention (spec §4.4).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval_dur = self.state.get_global_config().optimization_interval;
            if interval_dur.is_zero() {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }

            let mut ticker = tokio::time::interval(interval_dur);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One full optimization cycle: group by model, analyze, write decisions,
    /// fire triggers. Public so tests and a manual "optimize now" hook can
    /// invoke it directly without waiting on the interval.
    pub async fn run_once(&self) {
        self.metrics.cycles.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let tracked = self.state.get_ready_vas();
        let mut by_model: HashMap<String, Vec<(ResourceKey, VariantSpec, u32)>> = HashMap::new();
        for (key, entry) in tracked {
            by_model.entry(entry.spec.model_id.clone()).or_default().push((key, entry.spec, entry.current_replicas));
        }

        let config_snapshot = self.state.get_global_config();

        for (model_id, group) in by_model {
            if let Err(reason) = self.optimize_model(&model_id, &group, &config_snapshot.model_scaling).await {
                warn!(%model_id, %reason, "skipped optimization cycle for model");
                self.metrics.models_skipped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }

    async fn optimize_model(
        &self,
        model_id: &str,
        group: &[(ResourceKey, VariantSpec, u32)],
        scaling: &Arc<crate::config::ModelScalingConfigMap>,
    ) -> Result<(), String> {
        if group.is_empty() {
            return Ok(());
        }
        let model_config = scaling.get_model_config(model_id);
        let min_replicas = scaling.get_min_replicas(model_id);

        let (first_key, first_spec, _) = &group[0];
        let namespace = first_spec.namespace.clone();

        let mut pooled_replicas = Vec::new();
        let mut variant_states = Vec::with_capacity(group.len());
        for (_, spec, current_replicas) in group {
            let replicas = self
                .collector
                .collect_replica_metrics(model_id, &spec.namespace, &spec.scale_target_ref)
                .await
                .map_err(|e| e.to_string())?;
            let pending_replicas = replicas.iter().filter(|r| r.pending).count() as u32;
            pooled_replicas.extend(replicas);
            variant_states.push(VariantState {
                name: spec.resource_name.clone(),
                accelerator: spec.accelerator.clone(),
                cost: spec.variant_cost,
                ready_replicas: *current_replicas,
                pending_replicas,
            });
        }
        let _ = first_key;

        let outcomes = analyzer::analyze(&pooled_replicas, &variant_states, &model_config, min_replicas);

        for (_, spec, _) in group {
            let Some(outcome) = outcomes.get(&spec.resource_name) else { continue };
            let key = ResourceKey::new(&spec.namespace, &spec.resource_name);
            let decision = VariantDecision {
                variant_name: spec.resource_name.clone(),
                namespace: namespace.clone(),
                target_replicas: outcome.target_replicas,
                accelerator_name: outcome.accelerator_name.clone(),
                action: outcome.action,
                reason: outcome.reason.clone(),
            };

            let changed = self.state.get_decision(&key).map(|prev| prev != decision).unwrap_or(true);
            self.state.set_decision(key.clone(), decision.clone());
            self.metrics.decisions_written.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

            if decision.action != DecisionAction::Hold {
                debug!(variant = %spec.resource_name, action = %decision.action, target = decision.target_replicas, "optimization decision");
                self.state.fire_trigger(DecisionTriggerEvent { name: spec.resource_name.clone(), namespace: spec.namespace.clone() });
            } else if changed {
                self.state.fire_trigger(DecisionTriggerEvent { name: spec.resource_name.clone(), namespace: spec.namespace.clone() });
            }
        }

        info!(%model_id, variants = group.len(), "optimization cycle complete");
        Ok(())
    }
}

/// Helper used by the controller (C10) and by tests: resolves the decision
/// for a single resource key, falling back to a hold at the variant's
/// current replica count when no decision has been computed yet (e.g. the
/// engine has not yet run a cycle for this model).
pub fn decision_or_hold(state: &SharedState, key: &ResourceKey, current_replicas: u32, accelerator: &str) -> VariantDecision {
    state.get_decision(key).unwrap_or_else(|| VariantDecision {
        variant_name: key.0.rsplit('/').next().unwrap_or_default().to_string(),
        namespace: key.0.split('/').next().unwrap_or_default().to_string(),
        target_replicas: current_replicas,
        accelerator_name: accelerator.to_string(),
        action: DecisionAction::Hold,
        reason: "OptimizationPending: no decision computed yet".to_string(),
    })
}
