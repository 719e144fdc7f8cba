//! Metrics output (spec §6, "Metrics output (push/scrape)"): the four
//! gauges/counters external autoscalers read. Downstream consumers of these
//! series are out of scope (spec §1) — only their shapes matter here. Built
//! on `prometheus-client`, the closest registry-based metrics crate already
//! present in the retrieval pack (`rerun-io-rerun/crates/utils/re_perf_telemetry`).

use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct VariantLabels {
    variant: String,
    namespace: String,
    accelerator: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ScalingLabels {
    variant: String,
    namespace: String,
    accelerator: String,
    direction: String,
    reason: String,
}

pub struct MetricsSink {
    registry: Registry,
    desired_replicas: Family<VariantLabels, Gauge>,
    current_replicas: Family<VariantLabels, Gauge>,
    desired_ratio: Family<VariantLabels, Gauge<f64, AtomicU64>>,
    replica_scaling_total: Family<ScalingLabels, Counter>,
}

impl MetricsSink {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let desired_replicas = Family::<VariantLabels, Gauge>::default();
        registry.register("desired_replicas", "Optimizer-computed target replica count for a variant", desired_replicas.clone());

        let current_replicas = Family::<VariantLabels, Gauge>::default();
        registry.register("current_replicas", "Ready replica count for a variant", current_replicas.clone());

        let desired_ratio = Family::<VariantLabels, Gauge<f64, AtomicU64>>::default();
        registry.register("desired_ratio", "desired_replicas / current_replicas; external autoscalers target 1.0", desired_ratio.clone());

        let replica_scaling_total = Family::<ScalingLabels, Counter>::default();
        registry.register("replica_scaling_total", "Count of scaling actuations applied, by direction and reason", replica_scaling_total.clone());

        Self { registry, desired_replicas, current_replicas, desired_ratio, replica_scaling_total }
    }

    pub fn observe(&self, variant: &str, namespace: &str, accelerator: &str, desired: u32, current: u32) {
        let labels = VariantLabels { variant: variant.to_string(), namespace: namespace.to_string(), accelerator: accelerator.to_string() };
        self.desired_replicas.get_or_create(&labels).set(desired as i64);
        self.current_replicas.get_or_create(&labels).set(current as i64);

        let ratio = if current == 0 {
            if desired == 0 {
                1.0
            } else {
                f64::INFINITY
            }
        } else {
            desired as f64 / current as f64
        };
        self.desired_ratio.get_or_create(&labels).set(ratio);
    }

    pub fn record_scaling(&self, variant: &str, namespace: &str, accelerator: &str, direction: &str, reason: &str) {
        let labels = ScalingLabels {
            variant: variant.to_string(),
            namespace: namespace.to_string(),
            accelerator: accelerator.to_string(),
            direction: direction.to_string(),
            reason: reason.to_string(),
        };
        self.replica_scaling_total.get_or_create(&labels).inc();
    }

    /// Renders the registry in Prometheus text exposition format for a
    /// scrape endpoint supplied by the embedding process.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry).expect("encoding metrics registry cannot fail");
        buf
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_computes_desired_ratio() {
        let sink = MetricsSink::new();
        sink.observe("v1", "ns", "a100", 4, 2);
        let output = sink.encode();
        assert!(output.contains("desired_replicas"));
        assert!(output.contains("current_replicas"));
        assert!(output.contains("desired_ratio"));
    }

    #[test]
    fn observe_handles_zero_current_without_panicking() {
        let sink = MetricsSink::new();
        sink.observe("v1", "ns", "a100", 0, 0);
        sink.observe("v2", "ns", "a100", 2, 0);
        let _ = sink.encode();
    }

    #[test]
    fn record_scaling_increments_labeled_counter() {
        let sink = MetricsSink::new();
        sink.record_scaling("v1", "ns", "a100", "up", "SpareCapacityLow");
        let output = sink.encode();
        assert!(output.contains("replica_scaling_total"));
    }
}
