use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Sample type of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricType {
    /// Monotonic add.
    Counter,
    /// Last value wins.
    Gauge,
    /// Quantile-capable distribution.
    Histogram,
    Summary,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: f64,
    ts_ms: u64,
}

struct Series {
    metric_type: MetricType,
    /// Ring of recent samples, submission-ordered per submitter. Pruned to
    /// the largest aggregation window on every tick.
    ring: Mutex<Vec<Sample>>,
}

/// Rolling aggregate over one window.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Aggregate {
    pub window_ms: u64,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
}

/// Internal time-series store feeding the alerting and health subsystems.
///
/// This is deliberately separate from the Prometheus recorder: the recorder
/// serves scrapes, while this store answers "what was the mean of
/// `market_admit_latency_ms` over the last 60 s" questions locally and
/// synchronously. Series are keyed by `name{label=value,…}`; aggregates are
/// recomputed per metric name (labels merged) on the tick.
pub struct SeriesStore {
    series: DashMap<String, Series>,
    aggregates: DashMap<String, Vec<Aggregate>>,
    windows_ms: Vec<u64>,
}

fn series_key(name: &str, labels: &BTreeMap<String, String>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut key = String::with_capacity(name.len() + 16 * labels.len());
    key.push_str(name);
    key.push('{');
    for (i, (k, v)) in labels.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key.push('}');
    key
}

fn name_of(series_key: &str) -> &str {
    series_key.split('{').next().unwrap_or(series_key)
}

impl SeriesStore {
    pub fn new(mut windows_ms: Vec<u64>) -> Self {
        if windows_ms.is_empty() {
            windows_ms = vec![60_000, 300_000, 900_000];
        }
        windows_ms.sort_unstable();
        Self {
            series: DashMap::new(),
            aggregates: DashMap::new(),
            windows_ms,
        }
    }

    /// Ingest one sample.
    pub fn record(
        &self,
        name: &str,
        value: f64,
        metric_type: MetricType,
        labels: &BTreeMap<String, String>,
        ts_ms: u64,
    ) {
        let key = series_key(name, labels);
        let sample = Sample { value, ts_ms };

        if let Some(series) = self.series.get(&key) {
            series.ring.lock().unwrap().push(sample);
            return;
        }
        self.series
            .entry(key)
            .or_insert_with(|| Series {
                metric_type,
                ring: Mutex::new(Vec::new()),
            })
            .ring
            .lock()
            .unwrap()
            .push(sample);
    }

    /// Convenience: record with no labels at the current wall clock.
    pub fn record_now(&self, name: &str, value: f64, metric_type: MetricType) {
        self.record(
            name,
            value,
            metric_type,
            &BTreeMap::new(),
            crate::cache::now_ms(),
        );
    }

    /// Recompute aggregates for every metric name and prune old samples.
    pub fn tick(&self, now_ms: u64) {
        let max_window = *self.windows_ms.last().unwrap_or(&900_000);
        let cutoff = now_ms.saturating_sub(max_window);

        // Merge samples per metric name.
        let mut by_name: std::collections::HashMap<String, Vec<Sample>> =
            std::collections::HashMap::new();
        for entry in self.series.iter() {
            let mut ring = entry.value().ring.lock().unwrap();
            ring.retain(|s| s.ts_ms >= cutoff);
            by_name
                .entry(name_of(entry.key()).to_string())
                .or_default()
                .extend(ring.iter().copied());
        }

        for (name, samples) in by_name {
            let aggs: Vec<Aggregate> = self
                .windows_ms
                .iter()
                .map(|&window| compute_aggregate(&samples, window, now_ms))
                .collect();
            self.aggregates.insert(name, aggs);
        }

        // Drop empty series so abandoned label sets do not accumulate.
        self.series
            .retain(|_, s| !s.ring.lock().unwrap().is_empty());
    }

    /// Aggregates for a metric name, smallest window first. Present only
    /// after a tick has seen samples for the name.
    pub fn aggregates(&self, name: &str) -> Option<Vec<Aggregate>> {
        self.aggregates.get(name).map(|a| a.value().clone())
    }

    /// The smallest-window aggregate, which alerting evaluates against.
    pub fn shortest_aggregate(&self, name: &str) -> Option<Aggregate> {
        self.aggregates(name).and_then(|a| a.first().copied())
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn metric_type(&self, name: &str) -> Option<MetricType> {
        self.series
            .iter()
            .find(|e| name_of(e.key()) == name)
            .map(|e| e.value().metric_type)
    }
}

fn compute_aggregate(samples: &[Sample], window_ms: u64, now_ms: u64) -> Aggregate {
    let cutoff = now_ms.saturating_sub(window_ms);
    let mut agg = Aggregate {
        window_ms,
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
        ..Aggregate::default()
    };

    for s in samples.iter().filter(|s| s.ts_ms >= cutoff) {
        agg.count += 1;
        agg.sum += s.value;
        agg.min = agg.min.min(s.value);
        agg.max = agg.max.max(s.value);
    }

    if agg.count == 0 {
        agg.min = 0.0;
        agg.max = 0.0;
        return agg;
    }

    agg.mean = agg.sum / agg.count as f64;

    let variance: f64 = samples
        .iter()
        .filter(|s| s.ts_ms >= cutoff)
        .map(|s| {
            let d = s.value - agg.mean;
            d * d
        })
        .sum::<f64>()
        / agg.count as f64;
    agg.stddev = variance.sqrt();

    agg
}
