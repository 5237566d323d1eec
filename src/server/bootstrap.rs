use crate::cache::nskey;
use crate::cluster::NodeRole;
use crate::config::ControlConfig;
use crate::health::HealthLevel;
use crate::persist::Snapshot;
use crate::server::{api, ControlState, Orchestrator};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Startup failed before the node could serve: bad configuration.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// The replicated lease record is unreadable; refusing to guess who leads.
#[derive(Debug)]
pub struct LeaseCorruption(pub String);

impl std::fmt::Display for LeaseCorruption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "leader lease corrupt: {}", self.0)
    }
}

impl std::error::Error for LeaseCorruption {}

/// Node lifecycle: init → restore → loops → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: configuration and state wiring.
    let config = ControlConfig::load(&args.config_path)
        .map_err(|e| anyhow::Error::new(ConfigError(e.to_string())))?;
    let state = ControlState::new(config).await?;
    let orchestrator = Orchestrator::new(state.clone());

    // Phase 2: refuse to start over an unreadable lease record.
    check_lease_record(&state).await?;

    // Phase 3: restore durable state — snapshot first, then the trailing
    // replicated records layered on top.
    restore(&state).await;

    // Phase 4: background loops — every loop is owned here and stops on
    // the shared shutdown signal.
    let shutdown = Arc::new(Notify::new());
    start_background_loops(&state, &shutdown);

    // Phase 5: listeners.
    start_admin_server(&state, &args);
    tracing::info!(
        "server: starting control plane, node={}, listen={}",
        state.coordinator.node_id(),
        args.listen
    );
    let api_handle = tokio::spawn({
        let listen = args.listen.clone();
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown.clone();
        async move { api::run_api_server(&listen, orchestrator, shutdown).await }
    });

    // Phase 6: block until signal, then wind down.
    wait_for_shutdown(&shutdown).await;

    if state.coordinator.is_leader() {
        state.coordinator.step_down("shutdown").await;
    }
    write_snapshot(&state);

    if let Err(e) = api_handle.await {
        tracing::error!("server: api task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// A lease record that exists but cannot be decoded means the replicated
/// namespace is corrupt; electing over it risks two leaders.
async fn check_lease_record(state: &ControlState) -> Result<()> {
    match state.cache.get(&nskey("cluster", "lease")).await {
        Ok(Some(data)) => {
            if serde_json::from_slice::<crate::cluster::Lease>(&data).is_err() {
                return Err(anyhow::Error::new(LeaseCorruption(
                    "cluster/lease record is not a valid lease".to_string(),
                )));
            }
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!("bootstrap: lease record unreadable (cache down): {}", e);
        }
    }
    Ok(())
}

async fn restore(state: &ControlState) {
    let mut allocations: HashMap<String, crate::market::Allocation> = HashMap::new();

    if let Some(snapshot) = state.snapshots.load() {
        tracing::info!(
            "bootstrap: snapshot restored, taken_at={}, allocations={}",
            snapshot.taken_at_ms,
            snapshot.allocations.len()
        );
        for allocation in snapshot.allocations {
            allocations.insert(allocation.id.clone(), allocation);
        }
    }

    // Trailing replicated records win over the snapshot.
    for allocation in state.coordinator.reconcile_allocations() {
        allocations.insert(allocation.id.clone(), allocation);
    }

    if !allocations.is_empty() {
        state
            .market
            .reconcile(allocations.into_values().collect());
    }
}

// ---------------------------------------------------------------------------
// Loop owners — each function spawns tasks holding an interval/recv loop.
// The subsystem modules only provide single-shot operations.
// ---------------------------------------------------------------------------

/// Start every background loop of a node. Separated from `run` so an
/// embedded node (multi-node harnesses) can drive a full control plane
/// without binding listeners.
pub fn start_background_loops(state: &ControlState, shutdown: &Arc<Notify>) {
    start_channel_pumps(state, shutdown);
    start_cluster_loops(state, shutdown);
    start_market_loops(state, shutdown);
    start_observability_loops(state, shutdown);
    state.pools.start_maintenance(shutdown.clone());
    state.cache.start_gc(std::time::Duration::from_secs(60));
    state.limiter.start_gc();
}

/// Sleep for `duration`, returning `true` immediately on shutdown.
async fn sleep_or_shutdown(duration: std::time::Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

fn start_channel_pumps(state: &ControlState, shutdown: &Arc<Notify>) {
    // Command pump: marketplace → channel manager.
    if let Some(cmd_rx) = state.take_channel_cmd_rx() {
        let channels = state.channels.clone();
        tokio::spawn(async move {
            channels.run_commands(cmd_rx).await;
        });
    }

    // Event pump: channel manager → marketplace.
    if let Some(mut event_rx) = state.take_channel_event_rx() {
        let market = state.market.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = event_rx.recv() => match event {
                        Some(event) => market.handle_channel_event(event).await,
                        None => return,
                    },
                    _ = shutdown.notified() => return,
                }
            }
        });
    }
}

fn start_cluster_loops(state: &ControlState, shutdown: &Arc<Notify>) {
    let heartbeat_interval = std::time::Duration::from_millis(
        state.config.load().cluster.heartbeat_interval_ms,
    );

    // Heartbeat loop.
    {
        let coordinator = state.coordinator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                if sleep_or_shutdown(heartbeat_interval, &shutdown).await {
                    return;
                }
                coordinator.heartbeat_tick().await;
            }
        });
    }

    // Election monitor.
    {
        let coordinator = state.coordinator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                if sleep_or_shutdown(heartbeat_interval, &shutdown).await {
                    return;
                }
                coordinator.election_tick().await;
            }
        });
    }

    // Role transitions: a new leader reconciles the marketplace from the
    // replicated log; a demoted leader reaps its channels.
    {
        let coordinator = state.coordinator.clone();
        let market = state.market.clone();
        let channels = state.channels.clone();
        let mut roles = coordinator.role_watch();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut previous = NodeRole::Follower;
            loop {
                tokio::select! {
                    changed = roles.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let current = *roles.borrow();
                        match (previous, current) {
                            (_, NodeRole::Leader) if previous != NodeRole::Leader => {
                                let recovered = coordinator.reconcile_allocations();
                                if !recovered.is_empty() {
                                    market.reconcile(recovered);
                                    market.restore_channels().await;
                                }
                            }
                            (NodeRole::Leader, NodeRole::Follower) => {
                                channels.release_all().await;
                            }
                            _ => {}
                        }
                        previous = current;
                    }
                    _ = shutdown.notified() => return,
                }
            }
        });
    }

    // Follower apply pump.
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<crate::cluster::ReplicatedRecord>(256);
        state.coordinator.set_applied_sink(tx);
        let market = state.market.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    record = rx.recv() => match record {
                        Some(record) => {
                            if let Ok(allocation) =
                                serde_json::from_value::<crate::market::Allocation>(record.payload)
                            {
                                market.apply_replicated(allocation);
                            }
                        }
                        None => return,
                    },
                    _ = shutdown.notified() => return,
                }
            }
        });
    }
}

fn start_market_loops(state: &ControlState, shutdown: &Arc<Notify>) {
    // Expiry sweep.
    {
        let market = state.market.clone();
        let interval = market.cleanup_interval();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                if sleep_or_shutdown(interval, &shutdown).await {
                    return;
                }
                market.sweep(crate::cache::now_ms()).await;
            }
        });
    }

    // Channel integrity loop.
    {
        let channels = state.channels.clone();
        let interval = channels.integrity_interval();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                if sleep_or_shutdown(interval, &shutdown).await {
                    return;
                }
                channels.verify_all().await;
            }
        });
    }
}

fn start_observability_loops(state: &ControlState, shutdown: &Arc<Notify>) {
    let tick_interval =
        std::time::Duration::from_millis(state.config.load().metrics.tick_interval_ms);
    let series = state.series.clone();
    let alerts = state.alerts.clone();
    let health = state.health.clone();
    let coordinator = state.coordinator.clone();
    let shutdown_tick = shutdown.clone();

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(tick_interval, &shutdown_tick).await {
                return;
            }
            let now = crate::cache::now_ms();
            series.tick(now);
            alerts.evaluate(&series, now).await;
            health.tick(now).await;

            // Health feedback into the coordinator: a degraded node must
            // not keep (or seek) leadership.
            let self_state = match health.overall() {
                HealthLevel::Healthy | HealthLevel::Unknown => {
                    crate::cluster::NodeState::Healthy
                }
                HealthLevel::Degraded => crate::cluster::NodeState::Degraded,
                HealthLevel::Failing | HealthLevel::Failed => {
                    crate::cluster::NodeState::Failed
                }
            };
            coordinator.set_self_health(self_state);
        }
    });

    // Snapshot writer.
    {
        let state = state.clone();
        let interval = std::time::Duration::from_millis(
            state.config.load().persist.snapshot_interval_ms,
        );
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                if sleep_or_shutdown(interval, &shutdown).await {
                    return;
                }
                write_snapshot(&state);
            }
        });
    }
}

fn write_snapshot(state: &ControlState) {
    let snapshot = Snapshot {
        taken_at_ms: crate::cache::now_ms(),
        term: state.coordinator.current_term(),
        lease: state.coordinator.current_lease(),
        allocations: state.market.export_allocations(),
        nodes: state.coordinator.nodes_snapshot(),
    };
    if let Err(e) = state.snapshots.write(&snapshot) {
        tracing::error!("persist: snapshot write failed: {}", e);
    }
}

fn start_admin_server(state: &ControlState, args: &BootstrapArgs) {
    let s = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = api::run_admin_server(&admin_addr, s).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
