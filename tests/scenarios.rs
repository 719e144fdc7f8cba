//! End-to-end scenario tests driving the engine and controller together
//! through the public facade, as opposed to `analyzer`'s unit-level
//! coverage of the same saturation arithmetic. These confirm the pieces
//! actually compose: a decision computed by the engine reaches the
//! platform client through the controller, and the status it writes
//! reflects the applied actuation.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use variant_autoscaler_core::collector::MetricsCollector;
use variant_autoscaler_core::config::ModelScalingConfigMap;
use variant_autoscaler_core::controller::ReconciliationController;
use variant_autoscaler_core::engine::OptimizationEngine;
use variant_autoscaler_core::error::CoreResult;
use variant_autoscaler_core::fetcher::BackgroundFetcher;
use variant_autoscaler_core::metrics_cache::MetricsCache;
use variant_autoscaler_core::metrics_sink::MetricsSink;
use variant_autoscaler_core::metrics_source::{Health, MetricCategory, MetricSource, MetricSpec, MetricValue};
use variant_autoscaler_core::platform::{FakePlatformClient, PlatformClient};
use variant_autoscaler_core::state::{GlobalConfig, SharedState};
use variant_autoscaler_core::timeseries::{DataPoint, TimeSeries};
use variant_autoscaler_core::types::{DecisionAction, ResourceKey, ScaleTargetRef, VariantDecision, VariantSpec};

/// Every pooled replica reports the same kv/queue reading, enough to drive
/// one model's worth of scenarios end to end.
struct FlatSource {
    kv: f64,
    queue: u32,
}

#[async_trait]
impl MetricSource for FlatSource {
    fn name(&self) -> &str {
        "flat"
    }
    fn supported_categories(&self) -> &[MetricCategory] {
        &[MetricCategory::Vllm]
    }
    async fn query(&self, spec: &MetricSpec, _start: SystemTime, end: SystemTime) -> CoreResult<TimeSeries> {
        let mut ts = TimeSeries::new(spec.name.clone(), vec![("pod".into(), "p0".into())]);
        ts.append(DataPoint::new(end, if spec.name.contains("kv") { self.kv } else { self.queue as f64 }));
        Ok(ts)
    }
    async fn query_instant(&self, _spec: &MetricSpec) -> CoreResult<MetricValue> {
        Ok(MetricValue { value: 1.0, timestamp: SystemTime::now() })
    }
    fn health(&self) -> Health {
        Health::default()
    }
    async fn close(&self) {}
}

fn variant_spec(name: &str, model_id: &str, cost: f64) -> VariantSpec {
    VariantSpec {
        resource_name: name.into(),
        variant_id: format!("{model_id}-a100-1"),
        namespace: "ns".into(),
        scale_target_ref: ScaleTargetRef { kind: "Deployment".into(), name: name.into() },
        model_id: model_id.into(),
        accelerator: "a100".into(),
        accelerator_count: 1,
        variant_cost: cost,
        performance_params: None,
    }
}

fn harness(kv: f64, queue: u32) -> (Arc<SharedState>, Arc<OptimizationEngine>, Arc<FakePlatformClient>, Arc<ReconciliationController>) {
    let state = Arc::new(SharedState::new(GlobalConfig {
        optimization_interval: Duration::from_secs(30),
        model_scaling: Arc::new(ModelScalingConfigMap::parse(&std::collections::BTreeMap::new())),
    }));
    let source = Arc::new(FlatSource { kv, queue });
    let cache = Arc::new(MetricsCache::new(Duration::from_secs(300)));
    let fetcher = Arc::new(BackgroundFetcher::new(source.clone(), cache, Duration::from_secs(30)));
    let collector = Arc::new(MetricsCollector::new(source, fetcher));
    let engine = Arc::new(OptimizationEngine::new(state.clone(), collector));
    let platform = Arc::new(FakePlatformClient::new());
    let sink = Arc::new(MetricsSink::new());
    let controller = Arc::new(ReconciliationController::new(state.clone(), platform.clone(), sink));
    (state, engine, platform, controller)
}

// S1 (spec §8): a single under-saturated variant scales up by one and the
// decision reaches the platform as an actuation.
#[tokio::test]
async fn single_variant_scale_up_reaches_the_platform() {
    let (state, engine, platform, controller) = harness(0.77, 2);
    let key = ResourceKey::new("ns", "v1");
    let spec = variant_spec("v1", "m1", 10.0);
    platform.put_variant(key.clone(), spec.clone());
    platform.set_deployment_replicas("ns", "v1", 2);
    state.upsert_variant(key.clone(), spec, 2);

    engine.run_once().await;
    let decision = state.get_decision(&key).expect("engine wrote a decision");
    assert_eq!(decision.action, DecisionAction::ScaleUp);
    assert_eq!(decision.target_replicas, 3);

    controller.reconcile_all().await;

    let target = ScaleTargetRef { kind: "Deployment".into(), name: "v1".into() };
    assert_eq!(platform.get_scale_target_replicas(&target, "ns").await.unwrap(), 3);
    let status = platform.get_status(&key).unwrap();
    assert!(status.actuation.applied);
    assert_eq!(status.desired_optimized_alloc.unwrap().num_replicas, 3);
}

// S2 (spec §8): cost-aware scale-up across two variants of the same model —
// the cheapest variant is the one actuated; the pricier one holds. The
// pending-replica cascade-prevention branch (S3) is exercised directly at
// the analyzer boundary in `analyzer::tests::s3_cascade_prevention_when_cheapest_pending`,
// since the collector facade this harness drives never reports a pending
// replica for its fixed source.
#[tokio::test]
async fn cost_aware_scale_up_picks_cheapest_variant_end_to_end() {
    let (state, engine, platform, controller) = harness(0.77, 2);

    let cheap_key = ResourceKey::new("ns", "v_cheap");
    let cheap_spec = variant_spec("v_cheap", "m1", 5.0);
    platform.put_variant(cheap_key.clone(), cheap_spec.clone());
    platform.set_deployment_replicas("ns", "v_cheap", 2);
    state.upsert_variant(cheap_key.clone(), cheap_spec, 2);

    let exp_key = ResourceKey::new("ns", "v_exp");
    let exp_spec = variant_spec("v_exp", "m1", 20.0);
    platform.put_variant(exp_key.clone(), exp_spec.clone());
    platform.set_deployment_replicas("ns", "v_exp", 3);
    state.upsert_variant(exp_key.clone(), exp_spec, 3);

    engine.run_once().await;
    let cheap_decision = state.get_decision(&cheap_key).expect("decision written");
    let exp_decision = state.get_decision(&exp_key).expect("decision written");
    assert_eq!(cheap_decision.action, DecisionAction::ScaleUp);
    assert_eq!(exp_decision.action, DecisionAction::Hold);

    controller.reconcile_all().await;
    let cheap_target = ScaleTargetRef { kind: "Deployment".into(), name: "v_cheap".into() };
    let exp_target = ScaleTargetRef { kind: "Deployment".into(), name: "v_exp".into() };
    assert_eq!(platform.get_scale_target_replicas(&cheap_target, "ns").await.unwrap(), 3);
    assert_eq!(platform.get_scale_target_replicas(&exp_target, "ns").await.unwrap(), 3);
    assert!(platform.get_status(&cheap_key).unwrap().actuation.applied);
    assert!(!platform.get_status(&exp_key).unwrap().actuation.applied);
}

// Conflict arbitration: two variants sharing one scaleTargetRef never both
// actuate; the lexicographically-earlier resource key wins.
#[tokio::test]
async fn conflicting_scale_targets_resolve_deterministically() {
    let (state, _engine, platform, controller) = harness(0.77, 2);

    let a = variant_spec("a-variant", "m1", 10.0);
    let b = variant_spec("b-variant", "m1", 10.0);
    let mut shared_target = a.clone();
    shared_target.scale_target_ref = ScaleTargetRef { kind: "Deployment".into(), name: "shared".into() };
    let mut shared_b = b.clone();
    shared_b.scale_target_ref = ScaleTargetRef { kind: "Deployment".into(), name: "shared".into() };

    let key_a = ResourceKey::new("ns", "a-variant");
    let key_b = ResourceKey::new("ns", "b-variant");
    platform.put_variant(key_a.clone(), shared_target);
    platform.put_variant(key_b.clone(), shared_b);
    platform.set_deployment_replicas("ns", "shared", 2);

    // Force both variants to want a different replica count than the
    // current allocation, so the winner actually attempts an actuation
    // rather than taking the "already at target" no-op path.
    state.set_decision(
        key_a.clone(),
        VariantDecision { variant_name: "a-variant".into(), namespace: "ns".into(), target_replicas: 3, accelerator_name: "a100".into(), action: DecisionAction::ScaleUp, reason: "x".into() },
    );
    state.set_decision(
        key_b.clone(),
        VariantDecision { variant_name: "b-variant".into(), namespace: "ns".into(), target_replicas: 4, accelerator_name: "a100".into(), action: DecisionAction::ScaleUp, reason: "y".into() },
    );

    controller.reconcile_all().await;

    let status_a = platform.get_status(&key_a).unwrap();
    let status_b = platform.get_status(&key_b).unwrap();
    // Exactly one of the two conflicting variants is allowed to actuate.
    assert_ne!(status_a.actuation.applied, status_b.actuation.applied);
}
