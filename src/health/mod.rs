use crate::metrics::{AlertCenter, SeriesStore, Severity};
use crate::ratelimit::RateLimiter;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Component status ladder, worst first in the roll-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Failing,
    Failed,
    Unknown,
}

impl HealthLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Degraded => "degraded",
            HealthLevel::Failing => "failing",
            HealthLevel::Failed => "failed",
            HealthLevel::Unknown => "unknown",
        }
    }

    /// Roll-up severity: failed > failing > degraded > unknown > healthy.
    fn rank(self) -> u8 {
        match self {
            HealthLevel::Failed => 4,
            HealthLevel::Failing => 3,
            HealthLevel::Degraded => 2,
            HealthLevel::Unknown => 1,
            HealthLevel::Healthy => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub error_rate: f64,
    pub latency_ms: f64,
    pub load: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.05,
            latency_ms: 500.0,
            load: 0.9,
        }
    }
}

/// A registered probe. Each check reads the component's series from the
/// metrics store on its own cadence.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub component: String,
    pub interval_ms: u64,
    pub thresholds: HealthThresholds,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthLevel,
    pub last_check_ms: u64,
    pub metrics: HashMap<String, f64>,
}

/// Periodic per-component probing with alert integration.
///
/// The scheduler tick runs each due check, gated by the `health_checks`
/// rate-limit rule so a misconfigured interval cannot stampede the metrics
/// store. Evaluation reads the shortest-window aggregates of
/// `<component>_error_rate`, `<component>_latency_ms` and
/// `<component>_load`; a component with no samples at all is `Unknown`.
pub struct HealthMonitor {
    checks: DashMap<String, HealthCheck>,
    statuses: DashMap<String, ComponentHealth>,
    last_run_ms: DashMap<String, u64>,
    store: Arc<SeriesStore>,
    limiter: Arc<RateLimiter>,
    alerts: Arc<AlertCenter>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<SeriesStore>,
        limiter: Arc<RateLimiter>,
        alerts: Arc<AlertCenter>,
    ) -> Self {
        Self {
            checks: DashMap::new(),
            statuses: DashMap::new(),
            last_run_ms: DashMap::new(),
            store,
            limiter,
            alerts,
        }
    }

    pub fn register(&self, check: HealthCheck) {
        tracing::info!(
            "health: check registered, component={}, interval_ms={}",
            check.component,
            check.interval_ms
        );
        self.checks.insert(check.component.clone(), check);
    }

    /// Run every check whose interval has elapsed.
    pub async fn tick(&self, now_ms: u64) {
        let due: Vec<HealthCheck> = self
            .checks
            .iter()
            .filter(|c| {
                let last = self
                    .last_run_ms
                    .get(&c.component)
                    .map(|e| *e.value())
                    .unwrap_or(0);
                now_ms.saturating_sub(last) >= c.interval_ms
            })
            .map(|c| c.value().clone())
            .collect();

        for check in due {
            if !self.limiter.check("health_checks", 1).await.is_admitted() {
                tracing::debug!(
                    "health: probe deferred by rate limit, component={}",
                    check.component
                );
                continue;
            }
            self.last_run_ms.insert(check.component.clone(), now_ms);
            self.probe(&check, now_ms).await;
        }
    }

    async fn probe(&self, check: &HealthCheck, now_ms: u64) {
        let error_rate = self
            .store
            .shortest_aggregate(&format!("{}_error_rate", check.component));
        let latency = self
            .store
            .shortest_aggregate(&format!("{}_latency_ms", check.component));
        let load = self
            .store
            .shortest_aggregate(&format!("{}_load", check.component));

        let mut observed = HashMap::new();
        if let Some(agg) = &error_rate {
            observed.insert("error_rate".to_string(), agg.mean);
        }
        if let Some(agg) = &latency {
            observed.insert("latency_ms".to_string(), agg.mean);
        }
        if let Some(agg) = &load {
            observed.insert("load".to_string(), agg.mean);
        }

        let status = if observed.is_empty() {
            HealthLevel::Unknown
        } else if error_rate
            .map(|a| a.count > 0 && a.mean > check.thresholds.error_rate)
            .unwrap_or(false)
        {
            HealthLevel::Failing
        } else if latency
            .map(|a| a.count > 0 && a.mean > check.thresholds.latency_ms)
            .unwrap_or(false)
            || load
                .map(|a| a.count > 0 && a.mean > check.thresholds.load)
                .unwrap_or(false)
        {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        };

        self.apply_status(&check.component, status, observed, now_ms)
            .await;
    }

    /// Record a status observed out-of-band (probe timeout, hard failure).
    pub async fn mark(&self, component: &str, status: HealthLevel, now_ms: u64) {
        self.apply_status(component, status, HashMap::new(), now_ms)
            .await;
    }

    async fn apply_status(
        &self,
        component: &str,
        status: HealthLevel,
        observed: HashMap<String, f64>,
        now_ms: u64,
    ) {
        let previous = self.statuses.get(component).map(|s| s.status);
        self.statuses.insert(
            component.to_string(),
            ComponentHealth {
                component: component.to_string(),
                status,
                last_check_ms: now_ms,
                metrics: observed,
            },
        );

        if previous == Some(status) {
            return;
        }

        tracing::info!(
            "health: transition, component={}, from={}, to={}",
            component,
            previous.map(|p| p.as_str()).unwrap_or("none"),
            status.as_str()
        );
        metrics::counter!(
            "aether_health_transition_total",
            "component" => component.to_string(),
            "to" => status.as_str(),
        )
        .increment(1);

        match status {
            HealthLevel::Failing | HealthLevel::Failed => {
                let value = self
                    .statuses
                    .get(component)
                    .and_then(|s| s.metrics.get("error_rate").copied())
                    .unwrap_or(0.0);
                self.alerts
                    .open_alert(
                        component,
                        Severity::Error,
                        &format!("{}_error_rate", component),
                        value,
                        0.0,
                        now_ms,
                    )
                    .await;
            }
            HealthLevel::Degraded => {
                self.alerts
                    .open_alert(
                        component,
                        Severity::Warning,
                        &format!("{}_latency_ms", component),
                        0.0,
                        0.0,
                        now_ms,
                    )
                    .await;
            }
            HealthLevel::Healthy => {
                self.alerts.close_component(component, now_ms).await;
            }
            HealthLevel::Unknown => {}
        }
    }

    pub fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.statuses.get(name).map(|s| s.value().clone())
    }

    pub fn components(&self) -> Vec<ComponentHealth> {
        let mut all: Vec<ComponentHealth> =
            self.statuses.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.component.cmp(&b.component));
        all
    }

    /// Worst-of roll-up across every tracked component.
    pub fn overall(&self) -> HealthLevel {
        self.statuses
            .iter()
            .map(|s| s.status)
            .max_by_key(|s| s.rank())
            .unwrap_or(HealthLevel::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlertsConfig, RateLimitSection, RateRuleConfig};
    use crate::metrics::{MetricType, Notifier};

    fn monitor() -> (HealthMonitor, Arc<SeriesStore>) {
        let store = Arc::new(SeriesStore::new(vec![60_000]));
        let limiter = Arc::new(RateLimiter::new(RateLimitSection::default()));
        let alerts = Arc::new(AlertCenter::new(
            &AlertsConfig::default(),
            Arc::new(Notifier::new(Vec::new())),
        ));
        (
            HealthMonitor::new(store.clone(), limiter, alerts),
            store,
        )
    }

    fn check(component: &str) -> HealthCheck {
        HealthCheck {
            component: component.to_string(),
            interval_ms: 0,
            thresholds: HealthThresholds::default(),
        }
    }

    fn feed(store: &SeriesStore, name: &str, value: f64, now: u64) {
        store.record(
            name,
            value,
            MetricType::Gauge,
            &std::collections::BTreeMap::new(),
            now,
        );
    }

    #[tokio::test]
    async fn test_unknown_without_samples() {
        let (monitor, _store) = monitor();
        monitor.register(check("market"));
        monitor.tick(1000).await;
        assert_eq!(
            monitor.component("market").unwrap().status,
            HealthLevel::Unknown
        );
    }

    #[tokio::test]
    async fn test_error_rate_breach_is_failing() {
        let (monitor, store) = monitor();
        monitor.register(check("market"));

        let now = 1_000_000;
        feed(&store, "market_error_rate", 0.2, now);
        store.tick(now);
        monitor.tick(now).await;

        assert_eq!(
            monitor.component("market").unwrap().status,
            HealthLevel::Failing
        );
    }

    #[tokio::test]
    async fn test_latency_breach_is_degraded() {
        let (monitor, store) = monitor();
        monitor.register(check("channels"));

        let now = 1_000_000;
        feed(&store, "channels_error_rate", 0.0, now);
        feed(&store, "channels_latency_ms", 900.0, now);
        store.tick(now);
        monitor.tick(now).await;

        assert_eq!(
            monitor.component("channels").unwrap().status,
            HealthLevel::Degraded
        );
    }

    #[tokio::test]
    async fn test_healthy_under_thresholds() {
        let (monitor, store) = monitor();
        monitor.register(check("cache"));

        let now = 1_000_000;
        feed(&store, "cache_error_rate", 0.001, now);
        feed(&store, "cache_latency_ms", 5.0, now);
        feed(&store, "cache_load", 0.3, now);
        store.tick(now);
        monitor.tick(now).await;

        assert_eq!(
            monitor.component("cache").unwrap().status,
            HealthLevel::Healthy
        );
    }

    #[tokio::test]
    async fn test_overall_is_worst_of() {
        let (monitor, store) = monitor();
        monitor.register(check("market"));
        monitor.register(check("cache"));

        let now = 1_000_000;
        feed(&store, "market_error_rate", 0.5, now);
        feed(&store, "cache_error_rate", 0.0, now);
        store.tick(now);
        monitor.tick(now).await;

        assert_eq!(monitor.overall(), HealthLevel::Failing);

        monitor.mark("market", HealthLevel::Healthy, now + 1).await;
        assert_eq!(monitor.overall(), HealthLevel::Healthy);
    }

    #[tokio::test]
    async fn test_interval_gates_probe_cadence() {
        let (monitor, store) = monitor();
        let mut c = check("market");
        c.interval_ms = 10_000;
        monitor.register(c);

        let now = 1_000_000;
        feed(&store, "market_error_rate", 0.5, now);
        store.tick(now);
        monitor.tick(now).await;
        assert_eq!(
            monitor.component("market").unwrap().status,
            HealthLevel::Failing
        );

        // Status improves, but the next probe is not due yet.
        feed(&store, "market_error_rate", 0.0, now + 1000);
        store.tick(now + 1000);
        monitor.tick(now + 1000).await;
        assert_eq!(
            monitor.component("market").unwrap().status,
            HealthLevel::Failing
        );
    }
}
