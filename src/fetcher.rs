//! Background fetcher (spec §4.4, C4): a single cooperative worker that
//! periodically prefetches metrics for every tracked variant, with
//! exponential-backoff retry. Modeled on the teacher's single-worker
//! `tokio::time::interval` loops (`scheduler.rs`, `performance.rs`) rather
//! than spawning one task per variant.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::metrics_cache::MetricsCacheWriter;
use crate::metrics_source::{MetricSource, MetricSpec};
use crate::types::ResourceKey;

/// The minimal identity the fetcher needs to build queries for a variant; it
/// does not need the full `VariantSpec`.
#[derive(Debug, Clone)]
pub struct VariantInfo {
    pub model_id: String,
    pub namespace: String,
    pub accelerator: String,
}

#[derive(Default)]
pub struct FetcherMetrics {
    pub ticks: AtomicU64,
    pub fetches_ok: AtomicU64,
    pub fetches_failed: AtomicU64,
    pub evicted: AtomicU64,
}

const NO_FETCH_EVICTION: Duration = Duration::from_secs(5 * 60);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_FACTOR: u32 = 2;
const BACKOFF_STEPS: u32 = 3;

pub struct BackgroundFetcher {
    tracked: Arc<RwLock<HashMap<ResourceKey, VariantInfo>>>,
    last_fetch: Arc<RwLock<HashMap<ResourceKey, SystemTime>>>,
    last_touched: Arc<RwLock<HashMap<ResourceKey, SystemTime>>>,
    source: Arc<dyn MetricSource>,
    cache: Arc<dyn MetricsCacheWriter>,
    pub fetch_interval: Duration,
    pub metrics: Arc<FetcherMetrics>,
}

impl BackgroundFetcher {
    pub fn new(source: Arc<dyn MetricSource>, cache: Arc<dyn MetricsCacheWriter>, fetch_interval: Duration) -> Self {
        Self {
            tracked: Arc::new(RwLock::new(HashMap::new())),
            last_fetch: Arc::new(RwLock::new(HashMap::new())),
            last_touched: Arc::new(RwLock::new(HashMap::new())),
            source,
            cache,
            fetch_interval,
            metrics: Arc::new(FetcherMetrics::default()),
        }
    }

    /// Registers a variant for background prefetch; called by the collector
    /// facade (C5) on every cache-access call.
    pub fn track(&self, key: ResourceKey, info: VariantInfo) {
        let now = SystemTime::now();
        self.tracked.write().unwrap().insert(key.clone(), info);
        self.last_touched.write().unwrap().insert(key, now);
    }

    /// Explicit stop: removes a variant from background tracking immediately.
    pub fn untrack(&self, key: &ResourceKey) {
        self.tracked.write().unwrap().remove(key);
        self.last_fetch.write().unwrap().remove(key);
        self.last_touched.write().unwrap().remove(key);
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.read().unwrap().len()
    }

    /// Runs the fetch loop until `shutdown` signals true. `fetch_interval ==
    /// 0` disables the worker entirely (spec §4.4).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if self.fetch_interval.is_zero() {
            debug!("background fetcher disabled (fetch_interval = 0)");
            return;
        }
        let mut interval = tokio::time::interval(self.fetch_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        self.metrics.ticks.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now();
        self.evict_stale(now);

        let due: Vec<(ResourceKey, VariantInfo)> = {
            let tracked = self.tracked.read().unwrap();
            let last_fetch = self.last_fetch.read().unwrap();
            tracked
                .iter()
                .filter(|(key, _)| {
                    last_fetch.get(*key).map(|t| now.duration_since(*t).map(|age| age >= self.fetch_interval).unwrap_or(true)).unwrap_or(true)
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        for (key, info) in due {
            match self.fetch_with_retry(&info).await {
                Ok(()) => {
                    self.metrics.fetches_ok.fetch_add(1, Ordering::Relaxed);
                    self.last_fetch.write().unwrap().insert(key, SystemTime::now());
                }
                Err(e) => {
                    self.metrics.fetches_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(variant = %key, error = %e, "background fetch failed, will retry next cycle");
                    // Failures never block the worker or reconcile loop (§4.4).
                }
            }
        }
    }

    fn evict_stale(&self, now: SystemTime) {
        let mut stale = Vec::new();
        {
            let touched = self.last_touched.read().unwrap();
            for (key, t) in touched.iter() {
                if now.duration_since(*t).map(|age| age > NO_FETCH_EVICTION).unwrap_or(false) {
                    stale.push(key.clone());
                }
            }
        }
        for key in stale {
            self.untrack(&key);
            self.metrics.evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn fetch_with_retry(&self, info: &VariantInfo) -> Result<(), String> {
        let mut delay = BACKOFF_INITIAL;
        let spec = MetricSpec {
            name: "vllm:kv_cache_usage".into(),
            category: None,
            query: None,
            exact_labels: vec![("model_id".into(), info.model_id.clone()), ("namespace".into(), info.namespace.clone())],
            regex_labels: vec![],
            group_by: vec!["pod".into()],
        };
        let mut last_err = String::new();
        for step in 0..BACKOFF_STEPS {
            let end = SystemTime::now();
            let start = end - Duration::from_secs(300);
            match self.source.query(&spec, start, end).await {
                Ok(series) => {
                    self.cache.update_time_series(series);
                    self.cache.mark_collection_complete(SystemTime::now());
                    return Ok(());
                }
                Err(e) => {
                    last_err = e.to_string();
                    if step + 1 < BACKOFF_STEPS {
                        tokio::time::sleep(delay).await;
                        delay *= BACKOFF_FACTOR;
                    }
                }
            }
        }
        Err(last_err)
    }
}
