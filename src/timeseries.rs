//! Time-series primitives (spec §4.1, C1): data points, label-set keys,
//! windowed slicing/pruning, and the small ring-buffer wrapper the cache
//! builds on.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DataPoint {
    pub timestamp: SystemTime,
    pub value: f64,
}

impl DataPoint {
    pub fn new(timestamp: SystemTime, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Canonical key for a label set: sorted `key=value` pairs joined by `,`.
/// `key(L1) == key(L2) <=> L1 == L2` as multisets (spec §8 property 6).
pub fn label_set_key(labels: &[(String, String)]) -> String {
    let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs.join(",")
}

/// A mutable, ordered-by-timestamp series for one `(metric, labels)` pair.
/// Not thread-safe; all concurrency lives at the cache boundary (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeSeries {
    pub metric: String,
    pub labels: Vec<(String, String)>,
    pub points: Vec<DataPoint>,
}

impl TimeSeries {
    pub fn new(metric: impl Into<String>, labels: Vec<(String, String)>) -> Self {
        Self { metric: metric.into(), labels, points: Vec::new() }
    }

    pub fn label_key(&self) -> String {
        label_set_key(&self.labels)
    }

    /// Inserts a point keeping `points` sorted by timestamp ascending.
    pub fn append(&mut self, point: DataPoint) {
        match self.points.binary_search_by(|p| p.timestamp.cmp(&point.timestamp)) {
            Ok(idx) | Err(idx) => self.points.insert(idx, point),
        }
    }

    pub fn latest(&self) -> Option<DataPoint> {
        self.points.last().copied()
    }

    /// Points whose timestamp lies within `[now - window, now]`.
    pub fn window(&self, now: SystemTime, window: Duration) -> Vec<DataPoint> {
        let start = now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);
        self.points.iter().copied().filter(|p| p.timestamp >= start && p.timestamp <= now).collect()
    }

    /// Drops points older than `now - retention`, in place.
    pub fn prune(&mut self, now: SystemTime, retention: Duration) {
        let cutoff = now.checked_sub(retention).unwrap_or(SystemTime::UNIX_EPOCH);
        self.points.retain(|p| p.timestamp >= cutoff);
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Wraps a series with a retention window and an optional cap on point
/// count; every append evicts by retention first, then by max-points,
/// keeping the most recent (spec §4.1).
#[derive(Debug, Clone)]
pub struct TimeSeriesBuffer {
    pub series: TimeSeries,
    pub retention: Duration,
    pub max_points: Option<usize>,
}

impl TimeSeriesBuffer {
    pub fn new(series: TimeSeries, retention: Duration, max_points: Option<usize>) -> Self {
        Self { series, retention, max_points }
    }

    pub fn append(&mut self, now: SystemTime, point: DataPoint) {
        self.series.append(point);
        self.series.prune(now, self.retention);
        if let Some(cap) = self.max_points {
            let len = self.series.points.len();
            if len > cap {
                self.series.points.drain(0..(len - cap));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggType {
    Sum,
    Avg,
    Max,
    Min,
    Count,
    P50,
    P90,
    P95,
    P99,
    Rate,
    Delta,
    Last,
}

impl AggType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggType::Sum => "sum",
            AggType::Avg => "avg",
            AggType::Max => "max",
            AggType::Min => "min",
            AggType::Count => "count",
            AggType::P50 => "p50",
            AggType::P90 => "p90",
            AggType::P95 => "p95",
            AggType::P99 => "p99",
            AggType::Rate => "rate",
            AggType::Delta => "delta",
            AggType::Last => "last",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Window {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
}

impl Window {
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::OneMinute => "1m",
            Window::FiveMinutes => "5m",
            Window::FifteenMinutes => "15m",
            Window::OneHour => "1h",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Window::OneMinute => Duration::from_secs(60),
            Window::FiveMinutes => Duration::from_secs(5 * 60),
            Window::FifteenMinutes => Duration::from_secs(15 * 60),
            Window::OneHour => Duration::from_secs(60 * 60),
        }
    }
}

/// `AggregationKey(metric, aggType, window, groupBy) = "metric:aggType:window:sortedGroupBy"`.
pub fn aggregation_key(metric: &str, agg_type: AggType, window: Window, group_by: &[String]) -> String {
    let mut sorted = group_by.to_vec();
    sorted.sort();
    format!("{metric}:{}:{}:{}", agg_type.as_str(), window.as_str(), sorted.join(","))
}

/// Computes an aggregation over a slice of values, used by the cache writer
/// when pre-aggregating a fetched series (§4.2).
pub fn aggregate(values: &[f64], agg_type: AggType) -> Option<f64> {
    if values.is_empty() {
        return match agg_type {
            AggType::Count => Some(0.0),
            _ => None,
        };
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let sum: f64 = sorted.iter().sum();
    let percentile = |p: f64| -> f64 {
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    };
    Some(match agg_type {
        AggType::Sum => sum,
        AggType::Avg => sum / sorted.len() as f64,
        AggType::Max => *sorted.last().unwrap(),
        AggType::Min => sorted[0],
        AggType::Count => sorted.len() as f64,
        AggType::P50 => percentile(0.50),
        AggType::P90 => percentile(0.90),
        AggType::P95 => percentile(0.95),
        AggType::P99 => percentile(0.99),
        AggType::Rate => (sorted.last().unwrap() - sorted[0]).max(0.0),
        AggType::Delta => sorted.last().unwrap() - sorted[0],
        AggType::Last => *sorted.last().unwrap(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_set_key_is_order_independent() {
        let a = vec![("b".to_string(), "2".to_string()), ("a".to_string(), "1".to_string())];
        let b = vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())];
        assert_eq!(label_set_key(&a), label_set_key(&b));
        assert_eq!(label_set_key(&a), "a=1,b=2");
    }

    #[test]
    fn label_set_key_differs_for_different_multisets() {
        let a = vec![("a".to_string(), "1".to_string())];
        let b = vec![("a".to_string(), "2".to_string())];
        assert_ne!(label_set_key(&a), label_set_key(&b));
    }

    #[test]
    fn append_keeps_points_sorted() {
        let mut ts = TimeSeries::new("m", vec![]);
        let t0 = SystemTime::UNIX_EPOCH;
        ts.append(DataPoint::new(t0 + Duration::from_secs(10), 1.0));
        ts.append(DataPoint::new(t0 + Duration::from_secs(5), 0.5));
        ts.append(DataPoint::new(t0 + Duration::from_secs(20), 2.0));
        let timestamps: Vec<_> = ts.points.iter().map(|p| p.timestamp).collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
    }

    #[test]
    fn window_filters_to_recent_points() {
        let mut ts = TimeSeries::new("m", vec![]);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        ts.append(DataPoint::new(t0 - Duration::from_secs(120), 1.0));
        ts.append(DataPoint::new(t0 - Duration::from_secs(30), 2.0));
        let recent = ts.window(t0, Duration::from_secs(60));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].value, 2.0);
    }

    #[test]
    fn prune_drops_old_points() {
        let mut ts = TimeSeries::new("m", vec![]);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        ts.append(DataPoint::new(t0 - Duration::from_secs(3600), 1.0));
        ts.append(DataPoint::new(t0 - Duration::from_secs(10), 2.0));
        ts.prune(t0, Duration::from_secs(300));
        assert_eq!(ts.points.len(), 1);
    }

    #[test]
    fn buffer_evicts_by_retention_then_max_points() {
        let series = TimeSeries::new("m", vec![]);
        let mut buf = TimeSeriesBuffer::new(series, Duration::from_secs(3600), Some(2));
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000);
        buf.append(t0, DataPoint::new(t0, 1.0));
        buf.append(t0, DataPoint::new(t0 + Duration::from_secs(1), 2.0));
        buf.append(t0, DataPoint::new(t0 + Duration::from_secs(2), 3.0));
        assert_eq!(buf.series.points.len(), 2);
        assert_eq!(buf.series.points[0].value, 2.0);
    }

    #[test]
    fn aggregation_key_sorts_group_by() {
        let k1 = aggregation_key("kv", AggType::Avg, Window::OneMinute, &["pod".into(), "model".into()]);
        let k2 = aggregation_key("kv", AggType::Avg, Window::OneMinute, &["model".into(), "pod".into()]);
        assert_eq!(k1, k2);
        assert_eq!(k1, "kv:avg:1m:model,pod");
    }

    #[test]
    fn aggregate_empty_is_none_except_count() {
        assert_eq!(aggregate(&[], AggType::Avg), None);
        assert_eq!(aggregate(&[], AggType::Count), Some(0.0));
    }

    #[test]
    fn aggregate_basic_stats() {
        let vals = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(aggregate(&vals, AggType::Sum), Some(10.0));
        assert_eq!(aggregate(&vals, AggType::Avg), Some(2.5));
        assert_eq!(aggregate(&vals, AggType::Max), Some(4.0));
        assert_eq!(aggregate(&vals, AggType::Min), Some(1.0));
    }
}
