//! Metrics source adapter (spec §4.3, C3): the `MetricSource` contract and a
//! concrete Prometheus-compatible HTTP adapter. Grounded on the teacher's
//! trait-object pattern for pluggable subsystems (`controller_manager.rs`'s
//! `Controller` trait) and, for the HTTP client itself, on the pack's
//! `reqwest` dependency (`rerun-io-rerun/Cargo.toml`).

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{CoreError, CoreResult};
use crate::timeseries::{DataPoint, TimeSeries};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricCategory {
    Scheduler,
    Vllm,
    Gpu,
}

/// Describes one query the collector needs answered. When `query` is empty
/// the adapter builds a query expression from `name` + label matchers.
#[derive(Debug, Clone, Default)]
pub struct MetricSpec {
    pub name: String,
    pub category: Option<MetricCategory>,
    pub query: Option<String>,
    pub exact_labels: Vec<(String, String)>,
    pub regex_labels: Vec<(String, String)>,
    pub group_by: Vec<String>,
}

impl MetricSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// Builds a PromQL-style selector when no raw `query` was supplied.
    pub fn to_query_string(&self) -> String {
        if let Some(q) = &self.query {
            return q.clone();
        }
        let mut matchers: Vec<String> = self.exact_labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
        matchers.extend(self.regex_labels.iter().map(|(k, v)| format!("{k}=~\"{v}\"")));
        if matchers.is_empty() {
            self.name.clone()
        } else {
            format!("{}{{{}}}", self.name, matchers.join(","))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricValue {
    pub value: f64,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceHealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy)]
pub struct Health {
    pub status: SourceHealthStatus,
    pub last_check: SystemTime,
    pub last_success: Option<SystemTime>,
    pub consecutive_failures: u32,
}

impl Default for Health {
    fn default() -> Self {
        Self { status: SourceHealthStatus::Healthy, last_check: SystemTime::now(), last_success: None, consecutive_failures: 0 }
    }
}

/// Tracks the health-transition rules of §4.3: one success -> Healthy; one
/// failure after a success -> Degraded (`consecutive_failures = 1`);
/// `consecutive_failures >= 3` -> Unhealthy.
struct HealthTracker {
    state: Mutex<Health>,
}

impl HealthTracker {
    fn new() -> Self {
        Self { state: Mutex::new(Health::default()) }
    }

    fn record_success(&self, at: SystemTime) {
        let mut h = self.state.lock().unwrap();
        h.status = SourceHealthStatus::Healthy;
        h.last_check = at;
        h.last_success = Some(at);
        h.consecutive_failures = 0;
    }

    fn record_failure(&self, at: SystemTime) {
        let mut h = self.state.lock().unwrap();
        h.last_check = at;
        h.consecutive_failures += 1;
        h.status = if h.consecutive_failures >= 3 {
            SourceHealthStatus::Unhealthy
        } else {
            SourceHealthStatus::Degraded
        };
    }

    fn snapshot(&self) -> Health {
        *self.state.lock().unwrap()
    }
}

#[async_trait]
pub trait MetricSource: Send + Sync {
    fn name(&self) -> &str;
    fn supported_categories(&self) -> &[MetricCategory];
    async fn query(&self, spec: &MetricSpec, start: SystemTime, end: SystemTime) -> CoreResult<TimeSeries>;
    async fn query_instant(&self, spec: &MetricSpec) -> CoreResult<MetricValue>;
    fn health(&self) -> Health;
    async fn close(&self);
}

/// Minimal shape of a Prometheus `query_range`/`query` HTTP response body.
#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    data: PromData,
}

#[derive(Debug, Deserialize)]
struct PromData {
    result: Vec<PromResult>,
}

#[derive(Debug, Deserialize)]
struct PromResult {
    #[serde(default)]
    metric: std::collections::HashMap<String, String>,
    #[serde(default)]
    value: Option<(f64, String)>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// Prometheus-compatible vLLM/scheduler/GPU metrics source, the only
/// concrete adapter this crate ships (spec §1: the backend itself is out of
/// scope, only the query contract matters).
pub struct PrometheusMetricSource {
    name: String,
    base_url: String,
    client: reqwest::Client,
    deadline: Duration,
    categories: Vec<MetricCategory>,
    health: Arc<HealthTracker>,
}

impl PrometheusMetricSource {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, deadline: Duration) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            deadline,
            categories: vec![MetricCategory::Scheduler, MetricCategory::Vllm, MetricCategory::Gpu],
            health: Arc::new(HealthTracker::new()),
        }
    }

    fn endpoint(&self, range: bool) -> String {
        if range {
            format!("{}/api/v1/query_range", self.base_url)
        } else {
            format!("{}/api/v1/query", self.base_url)
        }
    }

    async fn execute(&self, query: &str, start: Option<SystemTime>, end: Option<SystemTime>) -> CoreResult<PromResponse> {
        let range = start.is_some();
        let mut req = self.client.get(self.endpoint(range)).query(&[("query", query)]);
        if let (Some(s), Some(e)) = (start, end) {
            let step = "15s";
            req = req.query(&[
                ("start", format!("{}", s.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_secs_f64())),
                ("end", format!("{}", e.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_secs_f64())),
                ("step", step.to_string()),
            ]);
        }
        let fut = req.timeout(self.deadline).send();
        let resp = tokio::time::timeout(self.deadline, fut)
            .await
            .map_err(|_| CoreError::SourceError(format!("{} query timed out after {:?}", self.name, self.deadline)))?
            .map_err(|e| CoreError::SourceError(format!("{} request failed: {e}", self.name)))?;

        let body: PromResponse = resp.json().await.map_err(|e| CoreError::SourceError(format!("{} decode failed: {e}", self.name)))?;
        if body.status != "success" {
            return Err(CoreError::SourceError(format!("{} returned status {}", self.name, body.status)));
        }
        Ok(body)
    }
}

#[async_trait]
impl MetricSource for PrometheusMetricSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_categories(&self) -> &[MetricCategory] {
        &self.categories
    }

    async fn query(&self, spec: &MetricSpec, start: SystemTime, end: SystemTime) -> CoreResult<TimeSeries> {
        let query = spec.to_query_string();
        let result = self.execute(&query, Some(start), Some(end)).await;
        let now = SystemTime::now();
        match result {
            Ok(body) => {
                self.health.record_success(now);
                let mut ts = TimeSeries::new(spec.name.clone(), vec![]);
                for series in body.data.result {
                    for (ts_secs, val_str) in &series.values {
                        let value: f64 = val_str.parse().unwrap_or(0.0);
                        let timestamp = SystemTime::UNIX_EPOCH + Duration::from_secs_f64(*ts_secs);
                        ts.append(DataPoint::new(timestamp, value));
                    }
                    if ts.labels.is_empty() {
                        ts.labels = series.metric.into_iter().collect();
                    }
                }
                if ts.is_empty() {
                    return Err(CoreError::MetricsMissing(spec.name.clone()));
                }
                Ok(ts)
            }
            Err(e) => {
                self.health.record_failure(now);
                Err(e)
            }
        }
    }

    async fn query_instant(&self, spec: &MetricSpec) -> CoreResult<MetricValue> {
        let query = spec.to_query_string();
        let result = self.execute(&query, None, None).await;
        let now = SystemTime::now();
        match result {
            Ok(body) => {
                self.health.record_success(now);
                let first = body.data.result.into_iter().next().ok_or_else(|| CoreError::MetricsMissing(spec.name.clone()))?;
                let (ts_secs, val_str) = first.value.ok_or_else(|| CoreError::MetricsMissing(spec.name.clone()))?;
                let value: f64 = val_str.parse().unwrap_or(0.0);
                Ok(MetricValue { value, timestamp: SystemTime::UNIX_EPOCH + Duration::from_secs_f64(ts_secs) })
            }
            Err(e) => {
                self.health.record_failure(now);
                Err(e)
            }
        }
    }

    fn health(&self) -> Health {
        self.health.snapshot()
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_spec_builds_selector_from_labels() {
        let mut spec = MetricSpec::new("vllm_kv_cache_usage");
        spec.exact_labels.push(("model_id".into(), "m1".into()));
        spec.regex_labels.push(("pod".into(), "m1-.*".into()));
        let q = spec.to_query_string();
        assert!(q.contains("model_id=\"m1\""));
        assert!(q.contains("pod=~\"m1-.*\""));
    }

    #[test]
    fn explicit_query_overrides_label_construction() {
        let mut spec = MetricSpec::new("x");
        spec.query = Some("sum(rate(x[1m]))".into());
        assert_eq!(spec.to_query_string(), "sum(rate(x[1m]))");
    }

    #[test]
    fn health_transitions_follow_spec() {
        let tracker = HealthTracker::new();
        let t = SystemTime::now();
        tracker.record_success(t);
        assert_eq!(tracker.snapshot().status, SourceHealthStatus::Healthy);

        tracker.record_failure(t);
        let h = tracker.snapshot();
        assert_eq!(h.status, SourceHealthStatus::Degraded);
        assert_eq!(h.consecutive_failures, 1);

        tracker.record_failure(t);
        tracker.record_failure(t);
        let h = tracker.snapshot();
        assert_eq!(h.status, SourceHealthStatus::Unhealthy);
        assert_eq!(h.consecutive_failures, 3);

        tracker.record_success(t);
        assert_eq!(tracker.snapshot().consecutive_failures, 0);
    }
}
