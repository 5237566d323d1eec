use crate::cache::{HttpCacheBacking, TypedCache};
use crate::channel::{ChannelCommand, ChannelEvent, ChannelManager};
use crate::cluster::{Coordinator, HttpPeerTransport, PeerTransport};
use crate::config::ControlConfig;
use crate::health::{HealthCheck, HealthMonitor, HealthThresholds};
use crate::market::Marketplace;
use crate::metrics::{AlertCenter, Metrics, Notifier, SeriesStore};
use crate::oracle::OracleSet;
use crate::persist::SnapshotStore;
use crate::pool::PoolManager;
use crate::ratelimit::RateLimiter;
use crate::resilience::{BreakerRegistry, Retrier};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Capacity of the marketplace ↔ channel-manager queues. Small on purpose:
/// backpressure here means establishment is falling behind admission.
const CHANNEL_QUEUE_DEPTH: usize = 64;

/// Shared control-plane state, cheaply cloneable.
///
/// Everything is wired exactly once here — no global singletons. Tests
/// construct the same aggregate with in-memory transports and oracles
/// injected, which is why the constructor takes them as parameters.
#[derive(Clone)]
pub struct ControlState {
    pub config: Arc<ArcSwap<ControlConfig>>,
    pub metrics: Metrics,
    pub cache: Arc<TypedCache>,
    pub limiter: Arc<RateLimiter>,
    pub breakers: Arc<BreakerRegistry>,
    pub retrier: Arc<Retrier>,
    pub pools: Arc<PoolManager>,
    pub series: Arc<SeriesStore>,
    pub alerts: Arc<AlertCenter>,
    pub health: Arc<HealthMonitor>,
    pub oracles: Arc<OracleSet>,
    pub market: Arc<Marketplace>,
    pub channels: Arc<ChannelManager>,
    pub coordinator: Arc<Coordinator>,
    pub snapshots: Arc<SnapshotStore>,
    /// Queue receivers parked here until bootstrap claims the pump loops.
    channel_cmd_rx: Arc<Mutex<Option<mpsc::Receiver<ChannelCommand>>>>,
    channel_event_rx: Arc<Mutex<Option<mpsc::Receiver<ChannelEvent>>>>,
}

impl ControlState {
    pub async fn new(config: ControlConfig) -> Result<Self> {
        let transport: Arc<dyn PeerTransport> = Arc::new(HttpPeerTransport::new());
        let oracles = Arc::new(OracleSet::from_config(&config.oracle));
        Self::with_collaborators(config, transport, oracles).await
    }

    /// Full wiring with injected collaborators.
    pub async fn with_collaborators(
        config: ControlConfig,
        transport: Arc<dyn PeerTransport>,
        oracles: Arc<OracleSet>,
    ) -> Result<Self> {
        let metrics = Metrics::install();

        let cache = match &config.cache.backing_url {
            Some(url) => {
                tracing::info!("cache: remote backing configured, url={}", url);
                Arc::new(TypedCache::with_backing(
                    config.cache.clone(),
                    Arc::new(HttpCacheBacking::new(url)),
                ))
            }
            None => Arc::new(TypedCache::new(config.cache.clone())),
        };

        let limiter = Arc::new(RateLimiter::with_cache(
            config.ratelimit.clone(),
            cache.clone(),
        ));

        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let retrier = Arc::new(Retrier::new(breakers.clone(), config.breaker.clone()));

        let pools = Arc::new(PoolManager::new(&config.pool));

        let series = Arc::new(SeriesStore::new(
            config.metrics.aggregation_windows_ms.clone(),
        ));
        let notifier = Arc::new(Notifier::from_config(&config.notifications));
        let alerts = Arc::new(AlertCenter::new(&config.alerts, notifier));
        let health = Arc::new(HealthMonitor::new(
            series.clone(),
            limiter.clone(),
            alerts.clone(),
        ));
        for component in ["market", "channels", "cluster", "cache"] {
            health.register(HealthCheck {
                component: component.to_string(),
                interval_ms: 15_000,
                thresholds: HealthThresholds::default(),
            });
        }

        let market = Arc::new(Marketplace::new(
            config.market.clone(),
            oracles.forecaster.clone(),
            oracles.names.clone(),
        ));

        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
        market.set_channel_sender(cmd_tx);

        let channels = Arc::new(ChannelManager::new(
            config.channel.clone(),
            oracles.crypto.clone(),
            pools.clone(),
            alerts.clone(),
            event_tx,
        ));

        let coordinator = Arc::new(Coordinator::new(
            config.cluster.clone(),
            transport,
            cache.clone(),
        ));

        let snapshots = Arc::new(SnapshotStore::new(&config.persist.snapshot_path));

        tracing::info!(
            "state: wired, node={}, peers={}, bands={}",
            coordinator.node_id(),
            config.cluster.peers.len(),
            config.market.bands.len()
        );

        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            cache,
            limiter,
            breakers,
            retrier,
            pools,
            series,
            alerts,
            health,
            oracles,
            market,
            channels,
            coordinator,
            snapshots,
            channel_cmd_rx: Arc::new(Mutex::new(Some(cmd_rx))),
            channel_event_rx: Arc::new(Mutex::new(Some(event_rx))),
        })
    }

    /// Claim the channel-command receiver. Callable once; the bootstrap
    /// loop owner takes it.
    pub fn take_channel_cmd_rx(&self) -> Option<mpsc::Receiver<ChannelCommand>> {
        self.channel_cmd_rx.lock().unwrap().take()
    }

    pub fn take_channel_event_rx(&self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.channel_event_rx.lock().unwrap().take()
    }
}
