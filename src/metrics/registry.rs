use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for operation latency (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the admin `/metrics`
/// endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: Option<PrometheusHandle>,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Meant to be called once at startup; a second install
    /// (several nodes in one test process) keeps the existing recorder and
    /// renders nothing from this handle.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .ok();

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // request path
        describe_counter!(
            "aether_requests_total",
            Unit::Count,
            "Control-plane operations processed"
        );
        describe_histogram!(
            "aether_request_duration_seconds",
            Unit::Seconds,
            "End-to-end operation duration"
        );
        describe_counter!(
            "aether_errors_total",
            Unit::Count,
            "Operations failed, by error kind"
        );

        // rate limiting
        describe_counter!(
            "aether_ratelimit_allowed_total",
            Unit::Count,
            "Requests admitted by the rate limiter"
        );
        describe_counter!(
            "aether_ratelimit_rejected_total",
            Unit::Count,
            "Requests denied by the rate limiter"
        );
        describe_counter!(
            "aether_ratelimit_degraded_total",
            Unit::Count,
            "Distributed rate-limit checks that fell back to local buckets"
        );

        // breaker & retry
        describe_counter!(
            "aether_breaker_rejected_total",
            Unit::Count,
            "Calls short-circuited by an open breaker"
        );
        describe_counter!(
            "aether_breaker_failures_total",
            Unit::Count,
            "Failures counted toward breaker thresholds"
        );
        describe_counter!(
            "aether_retry_attempts_total",
            Unit::Count,
            "Retry attempts after a retryable failure"
        );

        // cache
        describe_counter!(
            "aether_cache_evictions_total",
            Unit::Count,
            "LRU eviction batches run by the cache sweeper"
        );

        // pools
        describe_gauge!(
            "aether_pool_in_use",
            Unit::Count,
            "Handles currently held per pool class"
        );
        describe_gauge!(
            "aether_pool_idle",
            Unit::Count,
            "Idle handles available per pool class"
        );
        describe_counter!(
            "aether_pool_acquire_timeouts_total",
            Unit::Count,
            "Acquires that exhausted the acquire timeout"
        );

        // marketplace
        describe_gauge!(
            "aether_market_free_mbps",
            Unit::Count,
            "Free capacity per band in mbps"
        );
        describe_counter!(
            "aether_allocations_total",
            Unit::Count,
            "Allocation decisions, by outcome"
        );
        describe_counter!(
            "aether_allocations_expired_total",
            Unit::Count,
            "Allocations reclaimed by the expiry sweep"
        );

        // channels
        describe_gauge!(
            "aether_channels_live",
            Unit::Count,
            "Secure channels currently live"
        );
        describe_counter!(
            "aether_channel_integrity_failures_total",
            Unit::Count,
            "Channel verifications that came back suspect or dead"
        );

        // cluster
        describe_gauge!(
            "aether_cluster_is_leader",
            Unit::Count,
            "1 when this node holds the leader lease"
        );
        describe_counter!(
            "aether_cluster_elections_total",
            Unit::Count,
            "Leader elections started, by outcome"
        );
        describe_counter!(
            "aether_cluster_forwarded_total",
            Unit::Count,
            "Writes refused with a leader redirect"
        );

        // health & alerts
        describe_counter!(
            "aether_health_transition_total",
            Unit::Count,
            "Component health status transitions"
        );
        describe_counter!(
            "aether_alerts_opened_total",
            Unit::Count,
            "Alerts opened, by severity"
        );
        describe_counter!(
            "aether_alerts_closed_total",
            Unit::Count,
            "Alerts resolved, by severity"
        );
        describe_counter!(
            "aether_notifications_sent_total",
            Unit::Count,
            "Notifications delivered per channel"
        );
        describe_counter!(
            "aether_notifications_failed_total",
            Unit::Count,
            "Notification deliveries that failed per channel"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}
