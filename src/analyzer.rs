//! Saturation analyzer (spec §4.7, C7) — the algorithmic heart of the core.
//! Given replicas pooled across every variant of one model, the model's
//! scaling config, and per-variant cost/replica-count state, produces a
//! cost-aware, cascade-safe target-replica decision for at most one variant
//! per cycle.

use std::collections::BTreeMap;

use crate::config::ModelScalingConfig;
use crate::types::{DecisionAction, ReplicaMetrics};

/// Per-variant state the analyzer needs beyond the pooled replica list:
/// current counts, cost, and identity, for step 5's selection.
#[derive(Debug, Clone)]
pub struct VariantState {
    pub name: String,
    pub accelerator: String,
    pub cost: f64,
    pub ready_replicas: u32,
    pub pending_replicas: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantOutcome {
    pub target_replicas: u32,
    pub accelerator_name: String,
    pub action: DecisionAction,
    pub reason: String,
}

struct Classification {
    n_non_saturated: usize,
    avg_spare_kv: f64,
    avg_spare_q: f64,
    total_kv: f64,
    total_q: f64,
    any_pending: bool,
}

fn classify(replicas: &[ReplicaMetrics], config: &ModelScalingConfig) -> Classification {
    let any_pending = replicas.iter().any(|r| r.pending);
    let non_saturated: Vec<&ReplicaMetrics> = replicas
        .iter()
        .filter(|r| !r.pending && r.kv_cache_usage < config.kv_cache_threshold && (r.queue_length as f64) < config.queue_length_threshold)
        .collect();
    let n_non_saturated = non_saturated.len();

    if n_non_saturated == 0 {
        return Classification { n_non_saturated: 0, avg_spare_kv: 0.0, avg_spare_q: 0.0, total_kv: 0.0, total_q: 0.0, any_pending };
    }

    let total_kv: f64 = non_saturated.iter().map(|r| r.kv_cache_usage).sum();
    let total_q: f64 = non_saturated.iter().map(|r| r.queue_length as f64).sum();
    let spare_kv_sum: f64 = non_saturated.iter().map(|r| config.kv_cache_threshold - r.kv_cache_usage).sum();
    let spare_q_sum: f64 = non_saturated.iter().map(|r| config.queue_length_threshold - r.queue_length as f64).sum();

    Classification {
        n_non_saturated,
        avg_spare_kv: spare_kv_sum / n_non_saturated as f64,
        avg_spare_q: spare_q_sum / n_non_saturated as f64,
        total_kv,
        total_q,
        any_pending,
    }
}

/// Step 3: `shouldScaleUp`. `N_ns = 0` always yields `false` (§8 boundary).
fn should_scale_up(c: &Classification, config: &ModelScalingConfig) -> bool {
    if c.n_non_saturated == 0 {
        return false;
    }
    c.avg_spare_kv < config.kv_spare_trigger || c.avg_spare_q < config.queue_spare_trigger
}

/// Step 4: scale-down safety simulation.
fn scale_down_safe(c: &Classification, config: &ModelScalingConfig) -> bool {
    if c.n_non_saturated < 2 {
        return false;
    }
    let remaining = (c.n_non_saturated - 1) as f64;
    let kv_after = c.total_kv / remaining;
    let q_after = c.total_q / remaining;
    (config.kv_cache_threshold - kv_after) >= config.kv_spare_trigger && (config.queue_length_threshold - q_after) >= config.queue_spare_trigger
}

/// Picks the scale-up candidate: lowest cost across every variant of the
/// model, tie-broken by alphabetically-first name (spec §4.7 step 5). The
/// pending check is applied by the caller to this single winner — a cheaper
/// variant with pending replicas blocks the cycle entirely rather than
/// falling back to the next-cheapest variant (§8 property 4, spec S3:
/// "only v_cheap is eligible by cost, but it has pending replicas; v_exp is
/// not selected").
fn pick_scale_up<'a>(variants: &'a [VariantState]) -> Option<&'a VariantState> {
    variants.iter().fold(None, |best: Option<&VariantState>, v| match best {
        None => Some(v),
        Some(b) if v.cost < b.cost || (v.cost == b.cost && v.name < b.name) => Some(v),
        Some(b) => Some(b),
    })
}

/// Picks the scale-down candidate: highest cost among variants that still
/// have headroom above `minReplicas`, tie-broken by alphabetically-last
/// name. Variants already at `minReplicas` are never eligible, since
/// decrementing them would violate the `targetReplicas >= minReplicas`
/// invariant (spec §3, §8 property 2) regardless of the pooled safety
/// simulation's outcome.
fn pick_scale_down<'a>(variants: &'a [VariantState], min_replicas: u32) -> Option<&'a VariantState> {
    variants
        .iter()
        .filter(|v| v.ready_replicas > min_replicas)
        .fold(None, |best: Option<&VariantState>, v| match best {
            None => Some(v),
            Some(b) if v.cost > b.cost || (v.cost == b.cost && v.name > b.name) => Some(v),
            Some(b) => Some(b),
        })
}

/// Runs the full five-step analysis for one model and returns a decision
/// outcome for every variant passed in (holds included).
pub fn analyze(replicas: &[ReplicaMetrics], variants: &[VariantState], config: &ModelScalingConfig, min_replicas: u32) -> BTreeMap<String, VariantOutcome> {
    let mut out: BTreeMap<String, VariantOutcome> = variants
        .iter()
        .map(|v| {
            (
                v.name.clone(),
                VariantOutcome {
                    target_replicas: v.ready_replicas.max(min_replicas),
                    accelerator_name: v.accelerator.clone(),
                    action: DecisionAction::Hold,
                    reason: "Holding at ready replica count".to_string(),
                },
            )
        })
        .collect();

    let c = classify(replicas, config);

    if c.n_non_saturated == 0 && !c.any_pending {
        for outcome in out.values_mut() {
            outcome.reason = "MetricsUnavailable: no non-saturated or pending replicas observed".to_string();
        }
        return out;
    }

    let scale_up = should_scale_up(&c, config);
    let scale_down = !scale_up && scale_down_safe(&c, config);

    if scale_up {
        match pick_scale_up(variants) {
            Some(winner) if winner.pending_replicas == 0 => {
                if let Some(outcome) = out.get_mut(&winner.name) {
                    outcome.target_replicas = winner.ready_replicas + 1;
                    outcome.action = DecisionAction::ScaleUp;
                    outcome.reason = format!(
                        "avg spare kv {:.3} < trigger {:.3} or avg spare queue {:.3} < trigger {:.3}; scaling cheapest eligible variant",
                        c.avg_spare_kv, config.kv_spare_trigger, c.avg_spare_q, config.queue_spare_trigger
                    );
                }
            }
            _ => {
                for outcome in out.values_mut() {
                    outcome.reason = "OptimizationSkipped: cheapest variant has pending replicas, cascade-prevented".to_string();
                }
            }
        }
    } else if scale_down {
        match pick_scale_down(variants, min_replicas) {
            Some(winner) => {
                if let Some(outcome) = out.get_mut(&winner.name) {
                    let target = winner.ready_replicas.saturating_sub(1).max(min_replicas);
                    outcome.target_replicas = target;
                    outcome.action = DecisionAction::ScaleDown;
                    outcome.reason = format!(
                        "spare capacity ample after redistribution; trimming most expensive variant (cost {:.2})",
                        winner.cost
                    );
                }
            }
            None => {
                for outcome in out.values_mut() {
                    outcome.reason = "OptimizationSkipped: no variant has headroom above minReplicas".to_string();
                }
            }
        }
    }

    out
}
