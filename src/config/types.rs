use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub ratelimit: RateLimitSection,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Bounded connection pools, keyed by backend class
    /// (e.g. "relational", "kv", "http_peer").
    #[serde(default = "default_pools")]
    pub pool: HashMap<String, PoolConfig>,

    #[serde(default)]
    pub market: MarketConfig,

    #[serde(default)]
    pub channel: ChannelConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,

    #[serde(default)]
    pub oracle: OracleConfig,

    /// Bearer tokens per tenant. Empty map disables authentication.
    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub persist: PersistConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            ratelimit: RateLimitSection::default(),
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            pool: default_pools(),
            market: MarketConfig::default(),
            channel: ChannelConfig::default(),
            metrics: MetricsConfig::default(),
            alerts: AlertsConfig::default(),
            notifications: NotificationsConfig::default(),
            oracle: OracleConfig::default(),
            auth: AuthConfig::default(),
            persist: PersistConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster coordination
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Stable node identity. Generated from hostname + random suffix when unset.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Address peers use to reach this node's API listener.
    #[serde(default = "default_advertise_addr")]
    pub advertise_addr: String,

    /// API addresses of the other cluster members.
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Missed heartbeats before a peer is marked failed.
    #[serde(default = "default_failover_threshold")]
    pub failover_threshold: u32,

    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,

    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            advertise_addr: default_advertise_addr(),
            peers: Vec::new(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            failover_threshold: default_failover_threshold(),
            lease_duration_ms: default_lease_duration_ms(),
            election_timeout_ms: default_election_timeout_ms(),
        }
    }
}

fn default_advertise_addr() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_failover_threshold() -> u32 {
    3
}

fn default_lease_duration_ms() -> u64 {
    10_000
}

fn default_election_timeout_ms() -> u64 {
    5000
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    /// Rule applied to keys with no explicit rule.
    #[serde(default)]
    pub default: RateRuleConfig,

    /// Named rules, keyed by limiter key prefix (e.g. "tenant", "health_checks").
    #[serde(default)]
    pub rules: HashMap<String, RateRuleConfig>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            default: RateRuleConfig::default(),
            rules: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateRuleConfig {
    /// "token_bucket" or "leaky_bucket".
    #[serde(default = "default_rl_algorithm")]
    pub algorithm: String,

    #[serde(default = "default_rl_capacity")]
    pub capacity: u64,

    /// Tokens per second (token bucket only).
    #[serde(default = "default_rl_refill_rate")]
    pub refill_rate: f64,

    /// Sliding window span (leaky bucket only).
    #[serde(default = "default_rl_window_ms")]
    pub window_ms: u64,

    /// Round the bucket through the shared cache so the limit is cluster-wide.
    #[serde(default)]
    pub distributed: bool,
}

impl Default for RateRuleConfig {
    fn default() -> Self {
        Self {
            algorithm: default_rl_algorithm(),
            capacity: default_rl_capacity(),
            refill_rate: default_rl_refill_rate(),
            window_ms: default_rl_window_ms(),
            distributed: false,
        }
    }
}

fn default_rl_algorithm() -> String {
    "token_bucket".to_string()
}

fn default_rl_capacity() -> u64 {
    100
}

fn default_rl_refill_rate() -> f64 {
    10.0
}

fn default_rl_window_ms() -> u64 {
    60_000
}

// ---------------------------------------------------------------------------
// Typed cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Hard memory cap; LRU eviction above this.
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,

    #[serde(default = "default_ttl_high_ms")]
    pub ttl_high_ms: u64,

    #[serde(default = "default_ttl_medium_ms")]
    pub ttl_medium_ms: u64,

    #[serde(default = "default_ttl_low_ms")]
    pub ttl_low_ms: u64,

    #[serde(default = "default_ttl_archival_ms")]
    pub ttl_archival_ms: u64,

    /// Remote key/value endpoint for distributed mode. Unset = local only.
    #[serde(default)]
    pub backing_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_cache_max_bytes(),
            ttl_high_ms: default_ttl_high_ms(),
            ttl_medium_ms: default_ttl_medium_ms(),
            ttl_low_ms: default_ttl_low_ms(),
            ttl_archival_ms: default_ttl_archival_ms(),
            backing_url: None,
        }
    }
}

fn default_cache_max_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_ttl_high_ms() -> u64 {
    60_000
}

fn default_ttl_medium_ms() -> u64 {
    300_000
}

fn default_ttl_low_ms() -> u64 {
    3_600_000
}

fn default_ttl_archival_ms() -> u64 {
    86_400_000
}

// ---------------------------------------------------------------------------
// Circuit breaker + retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Successful probes required in half-open before closing.
    #[serde(default = "default_probe_count")]
    pub probe_count: u32,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,

    /// Overall deadline for one wrapped call, fallback included.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            probe_count: default_probe_count(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_base: default_backoff_base(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

fn default_probe_count() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_call_timeout_ms() -> u64 {
    5000
}

// ---------------------------------------------------------------------------
// Connection pools
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_min_size")]
    pub min_size: usize,

    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// A handle held longer than this is considered leaked and force-released
    /// by the maintenance sweep.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: default_pool_min_size(),
            max_size: default_pool_max_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
        }
    }
}

fn default_pools() -> HashMap<String, PoolConfig> {
    let mut pools = HashMap::new();
    pools.insert("relational".to_string(), PoolConfig::default());
    pools.insert("kv".to_string(), PoolConfig::default());
    pools.insert("http_peer".to_string(), PoolConfig::default());
    pools
}

fn default_pool_min_size() -> usize {
    2
}

fn default_pool_max_size() -> usize {
    16
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

fn default_maintenance_interval_ms() -> u64 {
    30_000
}

// ---------------------------------------------------------------------------
// Bandwidth marketplace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Fraction of per-band capacity kept free as headroom.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,

    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    #[serde(default = "default_bands")]
    pub bands: Vec<BandConfig>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            safety_margin: default_safety_margin(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            bands: default_bands(),
        }
    }
}

/// One spectrum band: a named capacity region with a frequency range,
/// a power ceiling and intrinsic QoS properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandConfig {
    pub name: String,

    /// Inclusive lower frequency bound, in MHz.
    pub freq_low_mhz: f64,

    /// Exclusive upper frequency bound, in MHz.
    pub freq_high_mhz: f64,

    pub capacity_mbps: u64,

    #[serde(default = "default_power_ceiling_dbm")]
    pub power_ceiling_dbm: f64,

    /// Best latency this band can deliver.
    pub latency_class_ms: u64,

    /// Intrinsic reliability of the band.
    pub reliability: f64,
}

fn default_safety_margin() -> f64 {
    0.10
}

fn default_cleanup_interval_ms() -> u64 {
    300_000
}

fn default_power_ceiling_dbm() -> f64 {
    20.0
}

fn default_bands() -> Vec<BandConfig> {
    vec![
        BandConfig {
            name: "low".to_string(),
            freq_low_mhz: 617.0,
            freq_high_mhz: 960.0,
            capacity_mbps: 500,
            power_ceiling_dbm: 30.0,
            latency_class_ms: 30,
            reliability: 0.999,
        },
        BandConfig {
            name: "mid".to_string(),
            freq_low_mhz: 2496.0,
            freq_high_mhz: 3700.0,
            capacity_mbps: 1000,
            power_ceiling_dbm: 23.0,
            latency_class_ms: 10,
            reliability: 0.99999,
        },
        BandConfig {
            name: "high".to_string(),
            freq_low_mhz: 24_250.0,
            freq_high_mhz: 52_600.0,
            capacity_mbps: 4000,
            power_ceiling_dbm: 20.0,
            latency_class_ms: 2,
            reliability: 0.9999,
        },
    ]
}

// ---------------------------------------------------------------------------
// Secure channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// How often every live channel is integrity-verified.
    #[serde(default = "default_integrity_interval_ms")]
    pub integrity_interval_ms: u64,

    /// Bound on draining outstanding work during release.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            integrity_interval_ms: default_integrity_interval_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

fn default_integrity_interval_ms() -> u64 {
    60_000
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

// ---------------------------------------------------------------------------
// Metrics, alerts, notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_aggregation_windows_ms")]
    pub aggregation_windows_ms: Vec<u64>,

    /// Cadence of aggregate recomputation and rule evaluation.
    #[serde(default = "default_metrics_tick_ms")]
    pub tick_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            aggregation_windows_ms: default_aggregation_windows_ms(),
            tick_interval_ms: default_metrics_tick_ms(),
        }
    }
}

fn default_aggregation_windows_ms() -> Vec<u64> {
    vec![60_000, 300_000, 900_000]
}

fn default_metrics_tick_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Threshold rules keyed by metric name.
    #[serde(default)]
    pub thresholds: HashMap<String, ThresholdConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default)]
    pub warning: Option<f64>,

    #[serde(default)]
    pub error: Option<f64>,

    #[serde(default)]
    pub critical: Option<f64>,

    /// "ge" (fire when value >= threshold) or "le".
    #[serde(default = "default_comparison")]
    pub comparison: String,

    /// The condition must hold continuously this long before firing,
    /// and be false this long before the alert closes.
    #[serde(default = "default_alert_duration_ms")]
    pub duration_ms: u64,
}

fn default_comparison() -> String {
    "ge".to_string()
}

fn default_alert_duration_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub channels: Vec<NotificationChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannelConfig {
    /// "chat", "email" or "pager".
    pub kind: String,

    pub endpoint: String,

    #[serde(default = "default_channel_enabled")]
    pub enabled: bool,
}

fn default_channel_enabled() -> bool {
    true
}

// ---------------------------------------------------------------------------
// External collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default)]
    pub crypto_endpoint: Option<String>,

    #[serde(default)]
    pub forecaster_endpoint: Option<String>,

    #[serde(default)]
    pub nameservice_endpoint: Option<String>,

    #[serde(default)]
    pub ledger_endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// tenant → bearer token. Empty disables authentication.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistConfig {
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,

    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: default_snapshot_interval_ms(),
            snapshot_path: default_snapshot_path(),
        }
    }
}

fn default_snapshot_interval_ms() -> u64 {
    300_000
}

fn default_snapshot_path() -> String {
    "aether-snapshot.json".to_string()
}
