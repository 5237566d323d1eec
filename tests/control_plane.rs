//! End-to-end scenarios against an in-process cluster: three full nodes
//! wired over the in-memory peer transport, with in-process oracles.

use aether_control::cluster::MemoryPeerTransport;
use aether_control::config::{ClusterConfig, ControlConfig, RateRuleConfig};
use aether_control::error::ControlError;
use aether_control::market::{BandwidthRequest, QosRequirements};
use aether_control::metrics::Severity;
use aether_control::oracle::{
    MemoryCryptoOracle, MemoryLedger, MemoryNameService, OracleSet, TrendForecaster,
};
use aether_control::server::{bootstrap, ControlState, OperationContext, Orchestrator};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

struct TestNode {
    state: ControlState,
    orchestrator: Orchestrator,
    crypto: Arc<MemoryCryptoOracle>,
    shutdown: Arc<Notify>,
    addr: String,
}

impl TestNode {
    async fn start(
        addr: &str,
        peers: &[&str],
        transport: &Arc<MemoryPeerTransport>,
        tweak: impl FnOnce(&mut ControlConfig),
    ) -> Self {
        let mut config = ControlConfig::default();
        config.cluster = ClusterConfig {
            node_id: Some(format!("node-{}", addr)),
            advertise_addr: addr.to_string(),
            peers: peers.iter().map(|s| s.to_string()).collect(),
            heartbeat_interval_ms: 20,
            failover_threshold: 3,
            lease_duration_ms: 400,
            election_timeout_ms: 100,
        };
        config.persist.snapshot_path = std::env::temp_dir()
            .join(format!("aether_e2e_{}_{}.json", addr.replace(':', "_"), rand_suffix()))
            .to_string_lossy()
            .into_owned();
        // Generous default rule so only explicit rules throttle tests.
        config.ratelimit.default = RateRuleConfig {
            algorithm: "token_bucket".into(),
            capacity: 10_000,
            refill_rate: 10_000.0,
            window_ms: 1000,
            distributed: false,
        };
        tweak(&mut config);

        let crypto = Arc::new(MemoryCryptoOracle::new());
        let oracles = Arc::new(OracleSet {
            crypto: crypto.clone(),
            forecaster: Arc::new(TrendForecaster),
            names: Arc::new(MemoryNameService::new()),
            ledger: Arc::new(MemoryLedger::new()),
        });

        let peer_transport: Arc<dyn aether_control::cluster::PeerTransport> = transport.clone();
        let state = ControlState::with_collaborators(config, peer_transport, oracles)
            .await
            .expect("state wiring");
        transport.register(addr, state.coordinator.clone());

        let shutdown = Arc::new(Notify::new());
        bootstrap::start_background_loops(&state, &shutdown);

        Self {
            orchestrator: Orchestrator::new(state.clone()),
            state,
            crypto,
            shutdown,
            addr: addr.to_string(),
        }
    }

    fn ctx(&self, tenant: &str) -> OperationContext {
        OperationContext::new(tenant, None)
    }

    fn crash(&self, transport: &MemoryPeerTransport) {
        transport.disconnect(&self.addr);
        self.shutdown.notify_waiters();
    }
}

fn rand_suffix() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
}

fn request(id: &str, tenant: &str, mbps: u64) -> BandwidthRequest {
    BandwidthRequest {
        id: id.to_string(),
        tenant: tenant.to_string(),
        bandwidth_mbps: mbps,
        duration_s: 600,
        qos: QosRequirements {
            max_latency_ms: 10,
            min_reliability: 0.99999,
        },
        priority: 5,
        submitted_at_ms: 0,
    }
}

async fn three_node_cluster() -> (Arc<MemoryPeerTransport>, TestNode, TestNode, TestNode) {
    let transport = MemoryPeerTransport::new();
    let a = TestNode::start("a:7400", &["b:7400", "c:7400"], &transport, |_| {}).await;
    let b = TestNode::start("b:7400", &["a:7400", "c:7400"], &transport, |_| {}).await;
    let c = TestNode::start("c:7400", &["a:7400", "b:7400"], &transport, |_| {}).await;

    a.state.coordinator.run_election().await;
    a.state.coordinator.heartbeat_tick().await;
    assert!(a.state.coordinator.is_leader());
    (transport, a, b, c)
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn scenario_accept_then_release() {
    let (_t, a, _b, _c) = three_node_cluster().await;

    let started = Instant::now();
    let decision = a
        .orchestrator
        .allocate_bandwidth(&a.ctx("t1"), request("r1", "t1", 200))
        .await
        .unwrap();
    assert!(decision.accepted);

    let allocation = decision.allocation.unwrap();
    assert_eq!(
        allocation.status,
        aether_control::market::AllocationStatus::Active,
        "allocation must be active shortly after acceptance"
    );
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(a.orchestrator.capacity()["mid"].1, 800);

    // The channel invariant: exactly one live channel for the allocation.
    let channel = a
        .state
        .channels
        .channel_for_allocation(&allocation.id)
        .expect("live channel");
    assert_eq!(channel.allocation_id, allocation.id);
    assert_eq!(a.state.channels.live_count(), 1);

    a.orchestrator
        .release_bandwidth(&a.ctx("t1"), &allocation.id)
        .await
        .unwrap();
    assert_eq!(a.orchestrator.capacity()["mid"].1, 1000);

    // Released channels are torn down.
    assert!(
        wait_until(Duration::from_secs(1), || a.state.channels.live_count() == 0).await,
        "channel should be released with the allocation"
    );
}

#[tokio::test]
async fn scenario_capacity_exhaustion() {
    let (_t, a, _b, _c) = three_node_cluster().await;

    let d1 = a
        .orchestrator
        .allocate_bandwidth(&a.ctx("t1"), request("r1", "t1", 400))
        .await
        .unwrap();
    let d2 = a
        .orchestrator
        .allocate_bandwidth(&a.ctx("t1"), request("r2", "t1", 400))
        .await
        .unwrap();
    let d3 = a
        .orchestrator
        .allocate_bandwidth(&a.ctx("t1"), request("r3", "t1", 400))
        .await
        .unwrap();

    assert!(d1.accepted);
    assert!(d2.accepted);
    assert!(!d3.accepted, "900 of 1000 admissible at 10% margin");
    assert_eq!(d3.reason.as_deref(), Some("capacity_exhausted"));
}

#[tokio::test]
async fn scenario_follower_forwarding() {
    let (_t, a, b, _c) = three_node_cluster().await;

    let err = b
        .orchestrator
        .allocate_bandwidth(&b.ctx("t1"), request("r1", "t1", 200))
        .await
        .unwrap_err();
    match err {
        ControlError::NotLeader { leader } => {
            assert_eq!(leader.as_deref(), Some("a:7400"));
        }
        other => panic!("expected NotLeader, got {:?}", other),
    }

    // Client retries against the leader and succeeds.
    let decision = a
        .orchestrator
        .allocate_bandwidth(&a.ctx("t1"), request("r1", "t1", 200))
        .await
        .unwrap();
    assert!(decision.accepted);
}

#[tokio::test]
async fn scenario_leader_failover() {
    let (transport, a, b, c) = three_node_cluster().await;

    let decision = a
        .orchestrator
        .allocate_bandwidth(&a.ctx("t1"), request("r1", "t1", 200))
        .await
        .unwrap();
    let allocation_id = decision.allocation.unwrap().id;
    let old_term = a.state.coordinator.current_term();

    // Give replication a moment to reach the followers.
    assert!(
        wait_until(Duration::from_secs(1), || {
            b.state.market.get(&allocation_id).is_some()
                || c.state.market.get(&allocation_id).is_some()
        })
        .await,
        "allocation must replicate to followers"
    );

    a.crash(&transport);

    // Within lease_duration + election_timeout a new leader appears.
    let elected = wait_until(Duration::from_secs(5), || {
        b.state.coordinator.is_leader() || c.state.coordinator.is_leader()
    })
    .await;
    assert!(elected, "a new leader must be elected after the crash");

    let new_leader = if b.state.coordinator.is_leader() { &b } else { &c };
    assert!(new_leader.state.coordinator.current_term() > old_term);

    // The replicated allocation survives the failover.
    let survived = wait_until(Duration::from_secs(2), || {
        new_leader
            .orchestrator
            .list_active_allocations()
            .iter()
            .any(|al| al.id == allocation_id)
    })
    .await;
    assert!(survived, "active allocation must be visible on the new leader");
}

#[tokio::test]
async fn scenario_rate_limit_denial() {
    let transport = MemoryPeerTransport::new();
    let a = TestNode::start("a:7400", &[], &transport, |config| {
        config.ratelimit.rules.insert(
            "tenant:t1".into(),
            RateRuleConfig {
                algorithm: "token_bucket".into(),
                capacity: 10,
                refill_rate: 1.0,
                window_ms: 1000,
                distributed: false,
            },
        );
    })
    .await;
    a.state.coordinator.run_election().await;
    assert!(a.state.coordinator.is_leader());

    let mut rate_limited = 0;
    let mut decided = 0;
    for i in 0..20 {
        match a
            .orchestrator
            .allocate_bandwidth(&a.ctx("t1"), request(&format!("r{}", i), "t1", 200))
            .await
        {
            Ok(_) => decided += 1,
            Err(ControlError::RateLimited { .. }) => rate_limited += 1,
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert_eq!(decided, 10, "bucket capacity admits exactly 10");
    assert_eq!(rate_limited, 10);
}

#[tokio::test]
async fn scenario_integrity_loss() {
    let (_t, a, _b, _c) = three_node_cluster().await;

    let decision = a
        .orchestrator
        .allocate_bandwidth(&a.ctx("t1"), request("r1", "t1", 200))
        .await
        .unwrap();
    let allocation = decision.allocation.unwrap();
    let channel_id = a
        .state
        .channels
        .channel_for_allocation(&allocation.id)
        .unwrap()
        .id;

    // Two consecutive authoritative verification failures.
    a.crypto
        .fail_verify
        .store(true, std::sync::atomic::Ordering::Relaxed);
    a.state.channels.verify_all().await;
    a.state.channels.verify_all().await;

    let failed = wait_until(Duration::from_secs(2), || {
        a.state
            .market
            .get(&allocation.id)
            .map(|al| al.status == aether_control::market::AllocationStatus::Failed)
            .unwrap_or(false)
    })
    .await;
    assert!(failed, "allocation must fail on integrity loss");

    assert!(a.state.channels.state_of(&channel_id).is_none());
    assert!(
        a.state
            .alerts
            .has_open(&format!("channel/{}", channel_id), Severity::Error)
            .await,
        "integrity loss must raise an error alert"
    );
    assert_eq!(a.orchestrator.capacity()["mid"].1, 1000, "spectrum returned");
}

#[tokio::test]
async fn duplicate_submission_returns_original_decision() {
    let (_t, a, _b, _c) = three_node_cluster().await;

    let first = a
        .orchestrator
        .allocate_bandwidth(&a.ctx("t1"), request("r1", "t1", 200))
        .await
        .unwrap();
    let second = a
        .orchestrator
        .allocate_bandwidth(&a.ctx("t1"), request("r1", "t1", 200))
        .await
        .unwrap();
    assert_eq!(
        first.allocation.as_ref().unwrap().id,
        second.allocation.as_ref().unwrap().id
    );
    assert_eq!(a.orchestrator.capacity()["mid"].1, 800);
}

#[tokio::test]
async fn at_most_one_leader_at_any_time() {
    let (_t, a, b, c) = three_node_cluster().await;
    for _ in 0..10 {
        let leaders = [&a, &b, &c]
            .iter()
            .filter(|n| n.state.coordinator.is_leader())
            .count();
        assert!(leaders <= 1, "two concurrent leaders observed");
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}
