//! Autoscaling decision core for LLM inference deployments.
//!
//! This crate is the decision core only: it decides target replica counts
//! for inference-serving variants from pooled saturation metrics and writes
//! those decisions back through a `PlatformClient`. It does not watch
//! orchestration-platform resources, does not serve an HTTP API, and does
//! not implement CRD admission — those are the embedding process's job
//! (spec §1). The composition root below (`VariantAutoscaler`) wires the
//! three background workers together the way the teacher's
//! `NautilusTEEMaster` wires up its controller manager, scheduler, and API
//! server (`lib.rs`, `controller_manager.rs`).

pub mod analyzer;
pub mod collector;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod metrics_cache;
pub mod metrics_sink;
pub mod metrics_source;
pub mod platform;
pub mod state;
pub mod timeseries;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::collector::MetricsCollector;
use crate::config::ModelScalingConfigMap;
use crate::controller::ReconciliationController;
use crate::engine::OptimizationEngine;
use crate::fetcher::BackgroundFetcher;
use crate::metrics_cache::MetricsCache;
use crate::metrics_sink::MetricsSink;
use crate::metrics_source::MetricSource;
use crate::platform::PlatformClient;
use crate::state::{GlobalConfig, SharedState};

/// Initializes the global `tracing` subscriber from `RUST_LOG` (or `info`
/// when unset). Safe to call once per process; a second call is a no-op
/// error that callers should ignore (tests call it repeatedly).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Process-wide health rollup across the three workers (spec §9 "ambient
/// observability").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

pub struct PerformanceSnapshot {
    pub tracked_variants: usize,
    pub fetcher_ticks: u64,
    pub fetches_failed: u64,
    pub optimization_cycles: u64,
    pub decisions_written: u64,
    pub reconciles: u64,
    pub actuations_applied: u64,
    pub actuations_failed: u64,
}

/// Configuration needed to assemble a [`VariantAutoscaler`]: the optimizer
/// cadence, the background-fetch cadence, the per-model scaling thresholds,
/// and the concrete adapters for metrics and the orchestration platform.
pub struct AutoscalerConfig {
    pub optimization_interval: Duration,
    pub fetch_interval: Duration,
    pub metrics_cache_ttl: Duration,
    pub model_scaling: ModelScalingConfigMap,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            optimization_interval: Duration::from_secs(30),
            fetch_interval: Duration::from_secs(15),
            metrics_cache_ttl: Duration::from_secs(300),
            model_scaling: ModelScalingConfigMap::parse(&std::collections::BTreeMap::new()),
        }
    }
}

/// The composition root: owns `SharedState` and the three background
/// workers (fetcher, optimization engine, reconciliation controller),
/// spawned under one shutdown signal. Mirrors the teacher's
/// `NautilusTEEMaster` (`lib.rs`), which owns a `TeeControllerManager`, a
/// scheduler, and an API server behind the same kind of `start`/`stop` pair.
pub struct VariantAutoscaler {
    state: Arc<SharedState>,
    fetcher: Arc<BackgroundFetcher>,
    engine: Arc<OptimizationEngine>,
    controller: Arc<ReconciliationController>,
    sink: Arc<MetricsSink>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl VariantAutoscaler {
    pub fn new(config: AutoscalerConfig, source: Arc<dyn MetricSource>, platform: Arc<dyn PlatformClient>) -> Self {
        let state = Arc::new(SharedState::new(GlobalConfig {
            optimization_interval: config.optimization_interval,
            model_scaling: Arc::new(config.model_scaling),
        }));

        let cache = Arc::new(MetricsCache::new(config.metrics_cache_ttl));
        let fetcher = Arc::new(BackgroundFetcher::new(source.clone(), cache, config.fetch_interval));
        let collector = Arc::new(MetricsCollector::new(source, fetcher.clone()));
        let engine = Arc::new(OptimizationEngine::new(state.clone(), collector));
        let sink = Arc::new(MetricsSink::new());
        let controller = Arc::new(ReconciliationController::new(state.clone(), platform, sink.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self { state, fetcher, engine, controller, sink, shutdown_tx, shutdown_rx, handles: std::sync::Mutex::new(Vec::new()) }
    }

    pub fn shared_state(&self) -> Arc<SharedState> {
        self.state.clone()
    }

    pub fn metrics_sink(&self) -> Arc<MetricsSink> {
        self.sink.clone()
    }

    /// Spawns the three workers. Returns immediately; call [`Self::stop`] to
    /// signal shutdown and await completion.
    pub fn start(&self) {
        info!("starting variant autoscaler workers");
        let mut handles = self.handles.lock().unwrap();

        let fetcher = self.fetcher.clone();
        let rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move { fetcher.run(rx).await }));

        let engine = self.engine.clone();
        let rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move { engine.run(rx).await }));

        let controller = self.controller.clone();
        let rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move { controller.run(rx).await }));
    }

    /// Signals shutdown to every worker and awaits their completion.
    pub async fn stop(&self) {
        info!("stopping variant autoscaler workers");
        let _ = self.shutdown_tx.send(true);
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Coarse health rollup: degraded when the fetcher has accumulated
    /// failures without any successes, or the controller has failing
    /// actuations outnumbering applied ones.
    pub fn health_check(&self) -> HealthStatus {
        let fetches_ok = self.fetcher.metrics.fetches_ok.load(std::sync::atomic::Ordering::Relaxed);
        let fetches_failed = self.fetcher.metrics.fetches_failed.load(std::sync::atomic::Ordering::Relaxed);
        let actuations_applied = self.controller.metrics.actuations_applied.load(std::sync::atomic::Ordering::Relaxed);
        let actuations_failed = self.controller.metrics.actuations_failed.load(std::sync::atomic::Ordering::Relaxed);

        if (fetches_failed > 0 && fetches_ok == 0) || actuations_failed > actuations_applied {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn get_performance_metrics(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            tracked_variants: self.fetcher.tracked_count(),
            fetcher_ticks: self.fetcher.metrics.ticks.load(std::sync::atomic::Ordering::Relaxed),
            fetches_failed: self.fetcher.metrics.fetches_failed.load(std::sync::atomic::Ordering::Relaxed),
            optimization_cycles: self.engine.metrics.cycles.load(std::sync::atomic::Ordering::Relaxed),
            decisions_written: self.engine.metrics.decisions_written.load(std::sync::atomic::Ordering::Relaxed),
            reconciles: self.controller.metrics.reconciles.load(std::sync::atomic::Ordering::Relaxed),
            actuations_applied: self.controller.metrics.actuations_applied.load(std::sync::atomic::Ordering::Relaxed),
            actuations_failed: self.controller.metrics.actuations_failed.load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}
