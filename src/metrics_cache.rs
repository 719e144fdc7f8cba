//! Metrics cache (spec §4.2, C2): a keyed store of time series and
//! pre-aggregated values with TTL-governed reads, periodic pruning, and
//! atomic snapshots. Mirrors the teacher's `TeeMemoryStore` locking
//! discipline (`memory_store.rs`): `RwLock`-guarded maps, deep copies on
//! every read and write, no lock held across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use crate::timeseries::{AggType, TimeSeries, Window};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatedValue {
    pub value: f64,
    pub timestamp: SystemTime,
}

/// Immutable point-in-time copy of the cache contents, published atomically
/// by `mark_collection_complete`. Readers never observe a half-written
/// cycle (spec §4.2 invariant, §8 property 7).
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub series: HashMap<String, TimeSeries>,
    pub aggregated: HashMap<String, AggregatedValue>,
    pub collected_at: Option<SystemTime>,
}

#[derive(Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub writes: AtomicU64,
    pub prunes: AtomicU64,
}

pub trait MetricsCacheReader: Send + Sync {
    fn lookup(&self, metric: &str, label_key: &str) -> Option<TimeSeries>;
    fn lookup_aggregated(&self, metric: &str, agg_type: AggType, window: Window, group_by: &[String]) -> Option<AggregatedValue>;
    fn latest_scalar(&self, metric: &str, label_key: &str) -> Option<f64>;
    fn batch_lookup(&self, metrics: &[(String, String)]) -> HashMap<String, TimeSeries>;
    fn is_stale(&self, now: SystemTime) -> bool;
    fn snapshot(&self) -> Arc<Snapshot>;
}

pub trait MetricsCacheWriter: Send + Sync {
    fn update_time_series(&self, series: TimeSeries);
    fn update_aggregated(&self, key: String, value: AggregatedValue);
    fn mark_collection_complete(&self, now: SystemTime);
    fn prune(&self, now: SystemTime, retention: Duration);
}

struct Inner {
    series: RwLock<HashMap<String, TimeSeries>>,
    aggregated: RwLock<HashMap<String, AggregatedValue>>,
    last_collection_time: RwLock<Option<SystemTime>>,
    snapshot: RwLock<Arc<Snapshot>>,
}

/// The cache itself. `ttl` governs read freshness (spec invariant i);
/// `retention` governs pruning (invariant ii).
pub struct MetricsCache {
    inner: Arc<Inner>,
    pub ttl: Duration,
    pub metrics: Arc<CacheMetrics>,
}

impl MetricsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                series: RwLock::new(HashMap::new()),
                aggregated: RwLock::new(HashMap::new()),
                last_collection_time: RwLock::new(None),
                snapshot: RwLock::new(Arc::new(Snapshot::default())),
            }),
            ttl,
            metrics: Arc::new(CacheMetrics::default()),
        }
    }

    fn series_key(metric: &str, label_key: &str) -> String {
        format!("{metric}|{label_key}")
    }

    fn fresh(&self, ts: SystemTime, now: SystemTime) -> bool {
        now.duration_since(ts).map(|age| age <= self.ttl).unwrap_or(true)
    }
}

impl MetricsCacheReader for MetricsCache {
    fn lookup(&self, metric: &str, label_key: &str) -> Option<TimeSeries> {
        let key = Self::series_key(metric, label_key);
        let guard = self.inner.series.read().unwrap();
        let series = guard.get(&key)?;
        let latest = series.latest()?;
        let now = SystemTime::now();
        if self.fresh(latest.timestamp, now) {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            Some(series.clone())
        } else {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    fn lookup_aggregated(&self, metric: &str, agg_type: AggType, window: Window, group_by: &[String]) -> Option<AggregatedValue> {
        let key = crate::timeseries::aggregation_key(metric, agg_type, window, group_by);
        let guard = self.inner.aggregated.read().unwrap();
        let val = guard.get(&key)?;
        let now = SystemTime::now();
        if self.fresh(val.timestamp, now) {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            Some(*val)
        } else {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    fn latest_scalar(&self, metric: &str, label_key: &str) -> Option<f64> {
        self.lookup(metric, label_key).and_then(|ts| ts.latest()).map(|p| p.value)
    }

    fn batch_lookup(&self, metrics: &[(String, String)]) -> HashMap<String, TimeSeries> {
        let mut out = HashMap::with_capacity(metrics.len());
        for (metric, label_key) in metrics {
            if let Some(ts) = self.lookup(metric, label_key) {
                out.insert(Self::series_key(metric, label_key), ts);
            }
        }
        out
    }

    fn is_stale(&self, now: SystemTime) -> bool {
        match *self.inner.last_collection_time.read().unwrap() {
            None => true,
            Some(t) => now.duration_since(t).map(|age| age > self.ttl).unwrap_or(false),
        }
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.snapshot.read().unwrap())
    }
}

impl MetricsCacheWriter for MetricsCache {
    fn update_time_series(&self, series: TimeSeries) {
        let key = Self::series_key(&series.metric, &series.label_key());
        self.inner.series.write().unwrap().insert(key, series);
        self.metrics.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn update_aggregated(&self, key: String, value: AggregatedValue) {
        self.inner.aggregated.write().unwrap().insert(key, value);
        self.metrics.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn mark_collection_complete(&self, now: SystemTime) {
        {
            let mut last = self.inner.last_collection_time.write().unwrap();
            // Monotonic advance only (§3 MetricsCache invariant iii).
            if last.map(|prev| now > prev).unwrap_or(true) {
                *last = Some(now);
            }
        }
        let series = self.inner.series.read().unwrap().clone();
        let aggregated = self.inner.aggregated.read().unwrap().clone();
        let collected_at = *self.inner.last_collection_time.read().unwrap();
        let snap = Arc::new(Snapshot { series, aggregated, collected_at });
        *self.inner.snapshot.write().unwrap() = snap;
    }

    fn prune(&self, now: SystemTime, retention: Duration) {
        let mut series = self.inner.series.write().unwrap();
        series.retain(|_, ts| {
            ts.prune(now, retention);
            !ts.is_empty()
        });
        drop(series);
        let mut aggregated = self.inner.aggregated.write().unwrap();
        aggregated.retain(|_, v| now.duration_since(v.timestamp).map(|age| age <= retention).unwrap_or(true));
        self.metrics.prunes.fetch_add(1, Ordering::Relaxed);
    }
}
