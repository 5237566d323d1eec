use crate::config::{AlertsConfig, ThresholdConfig};
use crate::metrics::notify::Notifier;
use crate::metrics::series::SeriesStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub component: String,
    pub severity: Severity,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub opened_at_ms: u64,
    pub closed_at_ms: Option<u64>,
}

/// Condition-hold tracking for one metric rule.
#[derive(Debug, Default)]
struct RuleState {
    /// Severity the condition currently matches, and since when.
    firing: Option<(Severity, u64)>,
    /// Since when the condition has been continuously false.
    clear_since: Option<u64>,
}

/// Threshold evaluation and alert lifecycle.
///
/// Rules are evaluated against the shortest-window aggregate on every
/// metrics tick. A rule fires only after its comparison holds continuously
/// for `duration_ms`, opens one alert per `(component, severity)` while it
/// stays true, and closes the alert only after the condition has been false
/// for `duration_ms` again. Subsystems can also open and close alerts
/// directly (integrity loss, health transitions) through the same dedup.
pub struct AlertCenter {
    rules: HashMap<String, ThresholdConfig>,
    state: Mutex<HashMap<String, RuleState>>,
    open: Mutex<HashMap<(String, Severity), Alert>>,
    notifier: Arc<Notifier>,
}

impl AlertCenter {
    pub fn new(config: &AlertsConfig, notifier: Arc<Notifier>) -> Self {
        Self {
            rules: config.thresholds.clone(),
            state: Mutex::new(HashMap::new()),
            open: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    /// Evaluate every rule against the store. Called on the metrics tick.
    pub async fn evaluate(&self, store: &SeriesStore, now_ms: u64) {
        for (metric, rule) in &self.rules {
            let observed = store.shortest_aggregate(metric);
            let matched = observed.and_then(|agg| {
                if agg.count == 0 {
                    None
                } else {
                    highest_matching_severity(rule, agg.mean).map(|sev| (sev, agg.mean))
                }
            });

            let mut states = self.state.lock().await;
            let state = states.entry(metric.clone()).or_default();

            match matched {
                Some((severity, value)) => {
                    state.clear_since = None;
                    // A new or re-graded condition restarts the hold.
                    let since = match state.firing {
                        Some((current, since)) if current == severity => since,
                        _ => {
                            state.firing = Some((severity, now_ms));
                            now_ms
                        }
                    };
                    if now_ms.saturating_sub(since) >= rule.duration_ms {
                        let threshold = threshold_for(rule, severity);
                        drop(states);
                        self.open_alert(metric, severity, metric, value, threshold, now_ms)
                            .await;
                    }
                }
                None => {
                    state.firing = None;
                    let since = *state.clear_since.get_or_insert(now_ms);
                    if now_ms.saturating_sub(since) >= rule.duration_ms {
                        drop(states);
                        self.close_component(metric, now_ms).await;
                    }
                }
            }
        }
    }

    /// Open (or refresh) an alert, deduplicated by `(component, severity)`.
    pub async fn open_alert(
        &self,
        component: &str,
        severity: Severity,
        metric: &str,
        value: f64,
        threshold: f64,
        now_ms: u64,
    ) {
        let key = (component.to_string(), severity);
        let alert = {
            let mut open = self.open.lock().await;
            if open.contains_key(&key) {
                return; // already open — dedup
            }
            let alert = Alert {
                id: format!("alert-{:012x}", rand::random::<u64>() & 0xffff_ffff_ffff),
                component: component.to_string(),
                severity,
                metric: metric.to_string(),
                value,
                threshold,
                opened_at_ms: now_ms,
                closed_at_ms: None,
            };
            open.insert(key, alert.clone());
            alert
        };

        tracing::warn!(
            "alerts: opened, component={}, severity={}, metric={}, value={}, threshold={}",
            component,
            severity.as_str(),
            metric,
            value,
            threshold
        );
        metrics::counter!(
            "aether_alerts_opened_total",
            "severity" => severity.as_str(),
        )
        .increment(1);

        self.notifier.dispatch(&alert).await;
    }

    /// Close every open alert for a component, at any severity.
    pub async fn close_component(&self, component: &str, now_ms: u64) {
        let closed: Vec<Alert> = {
            let mut open = self.open.lock().await;
            let keys: Vec<(String, Severity)> = open
                .keys()
                .filter(|(c, _)| c == component)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| {
                    open.remove(&k).map(|mut a| {
                        a.closed_at_ms = Some(now_ms);
                        a
                    })
                })
                .collect()
        };

        for alert in closed {
            tracing::info!(
                "alerts: resolved, component={}, severity={}, metric={}, open_for_ms={}",
                alert.component,
                alert.severity.as_str(),
                alert.metric,
                now_ms.saturating_sub(alert.opened_at_ms)
            );
            metrics::counter!(
                "aether_alerts_closed_total",
                "severity" => alert.severity.as_str(),
            )
            .increment(1);
        }
    }

    pub async fn open_alerts(&self) -> Vec<Alert> {
        let open = self.open.lock().await;
        let mut alerts: Vec<Alert> = open.values().cloned().collect();
        alerts.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.component.cmp(&b.component)));
        alerts
    }

    pub async fn has_open(&self, component: &str, severity: Severity) -> bool {
        self.open
            .lock()
            .await
            .contains_key(&(component.to_string(), severity))
    }
}

fn highest_matching_severity(rule: &ThresholdConfig, value: f64) -> Option<Severity> {
    let cmp = |threshold: f64| {
        if rule.comparison == "le" {
            value <= threshold
        } else {
            value >= threshold
        }
    };
    if rule.critical.map(cmp).unwrap_or(false) {
        return Some(Severity::Critical);
    }
    if rule.error.map(cmp).unwrap_or(false) {
        return Some(Severity::Error);
    }
    if rule.warning.map(cmp).unwrap_or(false) {
        return Some(Severity::Warning);
    }
    None
}

fn threshold_for(rule: &ThresholdConfig, severity: Severity) -> f64 {
    match severity {
        Severity::Critical => rule.critical,
        Severity::Error => rule.error,
        Severity::Warning => rule.warning,
        Severity::Info => None,
    }
    .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::notify::testing::RecordingChannel;
    use crate::metrics::series::MetricType;
    use std::collections::BTreeMap;

    fn rule(warning: f64, error: f64, duration_ms: u64) -> ThresholdConfig {
        ThresholdConfig {
            warning: Some(warning),
            error: Some(error),
            critical: None,
            comparison: "ge".into(),
            duration_ms,
        }
    }

    fn center_with(
        metric: &str,
        rule: ThresholdConfig,
    ) -> (AlertCenter, Arc<RecordingChannel>) {
        let chat = RecordingChannel::new("chat");
        let notifier = Arc::new(Notifier::new(vec![chat.clone()]));
        let mut thresholds = HashMap::new();
        thresholds.insert(metric.to_string(), rule);
        let center = AlertCenter::new(&AlertsConfig { thresholds }, notifier);
        (center, chat)
    }

    fn feed(store: &SeriesStore, metric: &str, value: f64, ts: u64) {
        store.record(metric, value, MetricType::Gauge, &BTreeMap::new(), ts);
    }

    #[tokio::test]
    async fn test_alert_opens_only_after_min_duration() {
        let (center, chat) = center_with("error_rate", rule(0.05, 0.2, 1000));
        let store = SeriesStore::new(vec![60_000]);

        let t0 = 1_000_000u64;
        feed(&store, "error_rate", 0.3, t0);
        store.tick(t0);
        center.evaluate(&store, t0).await;
        assert!(!center.has_open("error_rate", Severity::Error).await);

        // Condition still true after the hold duration → opens.
        feed(&store, "error_rate", 0.3, t0 + 1000);
        store.tick(t0 + 1000);
        center.evaluate(&store, t0 + 1000).await;
        assert!(center.has_open("error_rate", Severity::Error).await);
        assert_eq!(chat.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_alert_deduplicated_while_open() {
        let (center, chat) = center_with("error_rate", rule(0.05, 0.2, 0));
        let store = SeriesStore::new(vec![60_000]);

        let t0 = 1_000_000u64;
        for i in 0..3 {
            feed(&store, "error_rate", 0.5, t0 + i * 100);
            store.tick(t0 + i * 100);
            center.evaluate(&store, t0 + i * 100).await;
        }
        assert_eq!(center.open_alerts().await.len(), 1);
        assert_eq!(chat.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_alert_closes_after_clear_duration() {
        let (center, _) = center_with("error_rate", rule(0.05, 0.2, 500));
        let store = SeriesStore::new(vec![60_000]);

        let t0 = 10_000_000u64;
        feed(&store, "error_rate", 0.5, t0);
        store.tick(t0);
        center.evaluate(&store, t0).await;
        feed(&store, "error_rate", 0.5, t0 + 500);
        store.tick(t0 + 500);
        center.evaluate(&store, t0 + 500).await;
        assert!(center.has_open("error_rate", Severity::Error).await);

        // Condition clears, but must stay clear for duration before closing.
        let t1 = t0 + 70_000; // old samples age out of the 60s window
        feed(&store, "error_rate", 0.01, t1);
        store.tick(t1);
        center.evaluate(&store, t1).await;
        assert!(center.has_open("error_rate", Severity::Error).await);

        feed(&store, "error_rate", 0.01, t1 + 500);
        store.tick(t1 + 500);
        center.evaluate(&store, t1 + 500).await;
        assert!(!center.has_open("error_rate", Severity::Error).await);
    }

    #[tokio::test]
    async fn test_severity_grading_picks_highest() {
        let (center, _) = center_with("latency", rule(100.0, 500.0, 0));
        let store = SeriesStore::new(vec![60_000]);

        let t0 = 1_000_000u64;
        feed(&store, "latency", 900.0, t0);
        store.tick(t0);
        center.evaluate(&store, t0).await;

        let open = center.open_alerts().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_direct_open_and_close() {
        let (center, chat) = center_with("unused", rule(1.0, 2.0, 0));
        center
            .open_alert("channel/chan-1", Severity::Error, "integrity", 2.0, 2.0, 123)
            .await;
        assert!(center.has_open("channel/chan-1", Severity::Error).await);
        assert_eq!(chat.sent.lock().unwrap().len(), 1);

        center.close_component("channel/chan-1", 456).await;
        assert!(!center.has_open("channel/chan-1", Severity::Error).await);
    }
}
