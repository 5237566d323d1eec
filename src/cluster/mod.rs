pub mod transport;

pub use transport::{HttpPeerTransport, MemoryPeerTransport, PeerTransport};

use crate::cache::{nskey, TtlClass, TypedCache};
use crate::config::ClusterConfig;
use crate::error::ControlError;
use crate::market::Allocation;
use dashmap::DashMap;
use futures_util::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Leader,
    Follower,
    Candidate,
}

impl NodeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeRole::Leader => "leader",
            NodeRole::Follower => "follower",
            NodeRole::Candidate => "candidate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Healthy,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub node_id: String,
    pub address: String,
    pub role: NodeRole,
    pub state: NodeState,
    pub last_heartbeat_ms: u64,
    pub term: u64,
    pub capabilities: Vec<String>,
}

/// A time-bounded grant of leader authority. At most one lease is honored
/// cluster-wide at any instant; every node checks expiry against its local
/// clock only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub leader_id: String,
    pub leader_addr: String,
    pub term: u64,
    pub granted_at_ms: u64,
    pub expires_at_ms: u64,
}

impl Lease {
    pub fn is_valid(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }
}

/// One entry of the replicated state sequence, linearized by `(term, seq)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatedRecord {
    pub namespace: String,
    pub term: u64,
    pub seq: u64,
    pub payload: serde_json::Value,
}

const SELF_HEALTH_HEALTHY: u8 = 0;
const SELF_HEALTH_DEGRADED: u8 = 1;
const SELF_HEALTH_FAILED: u8 = 2;

/// Cluster membership, leader election and replication.
///
/// Consensus depth is a deliberate leader-lease protocol: a candidate wins a
/// term with strictly more than half of the votes of currently-healthy
/// members and publishes a lease; holders renew, losers follow, and every
/// write is refused on non-leaders with a redirect. Replicated state is a
/// linearized `(term, seq)` append into the shared cache namespace —
/// followers apply strictly in order.
pub struct Coordinator {
    node_id: String,
    advertise_addr: String,
    config: ClusterConfig,
    /// Registry keyed by advertise address (self included).
    nodes: DashMap<String, ClusterNode>,
    term: AtomicU64,
    role: Mutex<NodeRole>,
    role_tx: watch::Sender<NodeRole>,
    lease: Mutex<Option<Lease>>,
    /// `(term, candidate)` this node voted for most recently.
    voted: Mutex<Option<(u64, String)>>,
    last_leader_contact_ms: AtomicU64,
    /// Election timeout for the current wait, re-randomized after every
    /// election round (±20%) to avoid repeated split votes.
    election_timeout_ms: AtomicU64,
    self_health: AtomicU8,
    transport: Arc<dyn PeerTransport>,
    cache: Arc<TypedCache>,
    seq: AtomicU64,
    last_applied: Mutex<(u64, u64)>,
    applied_tx: Mutex<Option<mpsc::Sender<ReplicatedRecord>>>,
}

impl Coordinator {
    pub fn new(
        config: ClusterConfig,
        transport: Arc<dyn PeerTransport>,
        cache: Arc<TypedCache>,
    ) -> Self {
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(generate_node_id);
        let advertise_addr = config.advertise_addr.clone();
        let now = crate::cache::now_ms();

        let nodes = DashMap::new();
        nodes.insert(
            advertise_addr.clone(),
            ClusterNode {
                node_id: node_id.clone(),
                address: advertise_addr.clone(),
                role: NodeRole::Follower,
                state: NodeState::Healthy,
                last_heartbeat_ms: now,
                term: 0,
                capabilities: vec!["market".to_string(), "channels".to_string()],
            },
        );
        // Configured peers start healthy; they earn `Failed` by silence.
        for peer in &config.peers {
            nodes.insert(
                peer.clone(),
                ClusterNode {
                    node_id: peer.clone(),
                    address: peer.clone(),
                    role: NodeRole::Follower,
                    state: NodeState::Healthy,
                    last_heartbeat_ms: now,
                    term: 0,
                    capabilities: Vec::new(),
                },
            );
        }

        let (role_tx, _) = watch::channel(NodeRole::Follower);
        let election_timeout = randomized_timeout(config.election_timeout_ms);

        Self {
            node_id,
            advertise_addr,
            config,
            nodes,
            term: AtomicU64::new(0),
            role: Mutex::new(NodeRole::Follower),
            role_tx,
            lease: Mutex::new(None),
            voted: Mutex::new(None),
            last_leader_contact_ms: AtomicU64::new(now),
            election_timeout_ms: AtomicU64::new(election_timeout),
            self_health: AtomicU8::new(SELF_HEALTH_HEALTHY),
            transport,
            cache,
            seq: AtomicU64::new(0),
            last_applied: Mutex::new((0, 0)),
            applied_tx: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn advertise_addr(&self) -> &str {
        &self.advertise_addr
    }

    pub fn current_term(&self) -> u64 {
        self.term.load(Ordering::Acquire)
    }

    pub fn role(&self) -> NodeRole {
        *self.role.lock().unwrap()
    }

    /// Observe role transitions (leader takeover reconciliation hangs off
    /// this).
    pub fn role_watch(&self) -> watch::Receiver<NodeRole> {
        self.role_tx.subscribe()
    }

    /// Sink for replicated records applied on this node (follower path).
    pub fn set_applied_sink(&self, tx: mpsc::Sender<ReplicatedRecord>) {
        *self.applied_tx.lock().unwrap() = Some(tx);
    }

    /// Health monitor feedback: a degraded leader steps down.
    pub fn set_self_health(&self, state: NodeState) {
        let value = match state {
            NodeState::Healthy => SELF_HEALTH_HEALTHY,
            NodeState::Degraded => SELF_HEALTH_DEGRADED,
            NodeState::Failed => SELF_HEALTH_FAILED,
        };
        self.self_health.store(value, Ordering::Release);
        if let Some(mut own) = self.nodes.get_mut(&self.advertise_addr) {
            own.state = state;
        }
    }

    pub fn is_leader(&self) -> bool {
        if self.role() != NodeRole::Leader {
            return false;
        }
        let lease = self.lease.lock().unwrap();
        matches!(&*lease, Some(l) if l.leader_id == self.node_id && l.is_valid(crate::cache::now_ms()))
    }

    /// Address clients should redirect writes to, if a valid lease is known.
    pub fn leader_address(&self) -> Option<String> {
        let lease = self.lease.lock().unwrap();
        lease
            .as_ref()
            .filter(|l| l.is_valid(crate::cache::now_ms()))
            .map(|l| l.leader_addr.clone())
    }

    pub fn current_lease(&self) -> Option<Lease> {
        self.lease.lock().unwrap().clone()
    }

    pub fn nodes_snapshot(&self) -> Vec<ClusterNode> {
        let mut nodes: Vec<ClusterNode> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.address.cmp(&b.address));
        nodes
    }

    // -- heartbeat path --

    /// One heartbeat round: refresh self, detect silent peers, renew the
    /// lease when leading, and gossip to peers.
    pub async fn heartbeat_tick(&self) {
        let now = crate::cache::now_ms();

        if let Some(mut own) = self.nodes.get_mut(&self.advertise_addr) {
            own.last_heartbeat_ms = now;
            own.role = self.role();
            own.term = self.current_term();
        }

        self.mark_silent_peers(now);

        if self.role() == NodeRole::Leader {
            if self.self_health.load(Ordering::Acquire) != SELF_HEALTH_HEALTHY {
                self.step_down("self health degraded").await;
                return;
            }
            self.renew_lease_if_due(now).await;
        }

        let own = self
            .nodes
            .get(&self.advertise_addr)
            .map(|e| e.value().clone());
        let Some(own) = own else { return };
        let lease = self.current_lease();

        let peers: Vec<String> = self.peer_addresses();
        let sends = peers.iter().map(|peer| {
            let own = own.clone();
            let lease = lease.clone();
            async move {
                if let Err(e) = self
                    .transport
                    .heartbeat(peer, &own, lease.as_ref())
                    .await
                {
                    tracing::debug!("cluster: heartbeat to {} failed: {}", peer, e);
                }
            }
        });
        join_all(sends).await;
    }

    /// Ingest a peer's heartbeat.
    pub fn handle_heartbeat(&self, from: ClusterNode, lease: Option<Lease>) {
        let now = crate::cache::now_ms();
        let address = from.address.clone();
        self.nodes.insert(
            address,
            ClusterNode {
                last_heartbeat_ms: now,
                state: from.state,
                ..from
            },
        );

        if let Some(incoming) = lease {
            if incoming.is_valid(now) {
                self.adopt_lease(incoming, now);
            }
        }
    }

    fn adopt_lease(&self, incoming: Lease, now: u64) {
        let mut lease = self.lease.lock().unwrap();
        let stale = matches!(&*lease, Some(current) if current.term > incoming.term);
        if stale {
            return;
        }

        let current_term = self.current_term();
        if incoming.term >= current_term {
            self.term.store(incoming.term, Ordering::Release);
            if incoming.leader_id != self.node_id {
                self.last_leader_contact_ms.store(now, Ordering::Release);
                let mut role = self.role.lock().unwrap();
                if *role != NodeRole::Follower {
                    tracing::info!(
                        "cluster: yielding to leader {}, term={}",
                        incoming.leader_id,
                        incoming.term
                    );
                    *role = NodeRole::Follower;
                    let _ = self.role_tx.send(NodeRole::Follower);
                    metrics::gauge!("aether_cluster_is_leader").set(0.0);
                }
            }
            *lease = Some(incoming);
        }
    }

    fn mark_silent_peers(&self, now: u64) {
        let silence_ms =
            self.config.heartbeat_interval_ms * self.config.failover_threshold as u64;
        for mut entry in self.nodes.iter_mut() {
            if entry.key() == &self.advertise_addr {
                continue;
            }
            if now.saturating_sub(entry.last_heartbeat_ms) > silence_ms {
                if entry.state != NodeState::Failed {
                    tracing::warn!(
                        "cluster: peer silent, address={}, last_heartbeat={}ms ago",
                        entry.address,
                        now.saturating_sub(entry.last_heartbeat_ms)
                    );
                    entry.state = NodeState::Failed;
                }
            }
        }
    }

    // -- election path --

    /// Check whether an election is due, and run one if so.
    pub async fn election_tick(&self) {
        if self.role() == NodeRole::Leader {
            return;
        }
        let now = crate::cache::now_ms();

        // A valid lease means a live leader somewhere.
        if let Some(lease) = self.current_lease() {
            if lease.is_valid(now) {
                return;
            }
        }

        let since_contact =
            now.saturating_sub(self.last_leader_contact_ms.load(Ordering::Acquire));
        if since_contact < self.election_timeout_ms.load(Ordering::Acquire) {
            return;
        }

        self.run_election().await;
    }

    /// One election round: bump the term, vote for self, gather votes from
    /// healthy members, win on strict majority.
    pub async fn run_election(&self) {
        if self.self_health.load(Ordering::Acquire) == SELF_HEALTH_FAILED {
            return;
        }

        let new_term = self.term.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut role = self.role.lock().unwrap();
            *role = NodeRole::Candidate;
        }
        let _ = self.role_tx.send(NodeRole::Candidate);
        *self.voted.lock().unwrap() = Some((new_term, self.node_id.clone()));

        let electorate: Vec<ClusterNode> = self
            .nodes
            .iter()
            .filter(|n| n.state != NodeState::Failed)
            .map(|n| n.value().clone())
            .collect();
        let electorate_size = electorate.len();

        tracing::info!(
            "cluster: election started, node={}, term={}, electorate={}",
            self.node_id,
            new_term,
            electorate_size
        );

        // Self-vote, plus the votes of reachable healthy peers.
        let peer_requests = electorate
            .iter()
            .filter(|n| n.address != self.advertise_addr)
            .map(|n| {
                let address = n.address.clone();
                async move {
                    match self
                        .transport
                        .request_vote(&address, &self.node_id, new_term)
                        .await
                    {
                        Ok(granted) => granted,
                        Err(e) => {
                            tracing::debug!("cluster: vote request to {} failed: {}", address, e);
                            false
                        }
                    }
                }
            });
        let granted = 1 + join_all(peer_requests)
            .await
            .into_iter()
            .filter(|g| *g)
            .count();

        if granted * 2 > electorate_size {
            tracing::info!(
                "cluster: election won, node={}, term={}, votes={}/{}",
                self.node_id,
                new_term,
                granted,
                electorate_size
            );
            metrics::counter!("aether_cluster_elections_total", "outcome" => "won").increment(1);
            self.become_leader(new_term).await;
        } else {
            tracing::info!(
                "cluster: election lost, node={}, term={}, votes={}/{}",
                self.node_id,
                new_term,
                granted,
                electorate_size
            );
            metrics::counter!("aether_cluster_elections_total", "outcome" => "lost").increment(1);
            {
                let mut role = self.role.lock().unwrap();
                *role = NodeRole::Follower;
            }
            let _ = self.role_tx.send(NodeRole::Follower);
            // Back off before trying again, re-jittered.
            self.last_leader_contact_ms
                .store(crate::cache::now_ms(), Ordering::Release);
            self.election_timeout_ms.store(
                randomized_timeout(self.config.election_timeout_ms),
                Ordering::Release,
            );
        }
    }

    /// Grant or refuse a vote. Refused while a valid lease is honored, on
    /// stale terms, and when the term's vote already went elsewhere.
    pub fn handle_vote_request(&self, candidate_id: &str, term: u64) -> bool {
        let now = crate::cache::now_ms();

        if term <= self.current_term() {
            return false;
        }
        if let Some(lease) = self.current_lease() {
            if lease.is_valid(now) && lease.leader_id != candidate_id {
                return false;
            }
        }
        {
            let mut voted = self.voted.lock().unwrap();
            if let Some((voted_term, voted_for)) = &*voted {
                if *voted_term >= term && voted_for != candidate_id {
                    return false;
                }
            }
            *voted = Some((term, candidate_id.to_string()));
        }

        self.term.store(term, Ordering::Release);
        {
            let mut role = self.role.lock().unwrap();
            if *role == NodeRole::Candidate {
                *role = NodeRole::Follower;
                let _ = self.role_tx.send(NodeRole::Follower);
            }
        }
        self.last_leader_contact_ms.store(now, Ordering::Release);
        tracing::info!(
            "cluster: vote granted, candidate={}, term={}",
            candidate_id,
            term
        );
        true
    }

    async fn become_leader(&self, term: u64) {
        let now = crate::cache::now_ms();
        let lease = Lease {
            leader_id: self.node_id.clone(),
            leader_addr: self.advertise_addr.clone(),
            term,
            granted_at_ms: now,
            expires_at_ms: now + self.config.lease_duration_ms,
        };

        if let Err(e) = self.publish_lease(&lease).await {
            tracing::error!("cluster: lease publish failed, staying follower: {}", e);
            let mut role = self.role.lock().unwrap();
            *role = NodeRole::Follower;
            let _ = self.role_tx.send(NodeRole::Follower);
            return;
        }

        *self.lease.lock().unwrap() = Some(lease);
        {
            let mut role = self.role.lock().unwrap();
            *role = NodeRole::Leader;
        }
        if let Some(mut own) = self.nodes.get_mut(&self.advertise_addr) {
            own.role = NodeRole::Leader;
            own.term = term;
        }
        metrics::gauge!("aether_cluster_is_leader").set(1.0);
        let _ = self.role_tx.send(NodeRole::Leader);
        tracing::info!(
            "cluster: leading, node={}, term={}, lease_ms={}",
            self.node_id,
            term,
            self.config.lease_duration_ms
        );
    }

    async fn renew_lease_if_due(&self, now: u64) {
        let due = {
            let lease = self.lease.lock().unwrap();
            match &*lease {
                Some(l) if l.leader_id == self.node_id => {
                    l.expires_at_ms.saturating_sub(now) < self.config.lease_duration_ms / 2
                }
                _ => false,
            }
        };
        if !due {
            return;
        }

        let renewed = {
            let lease = self.lease.lock().unwrap();
            let Some(current) = lease.as_ref() else { return };
            Lease {
                granted_at_ms: now,
                expires_at_ms: now + self.config.lease_duration_ms,
                ..current.clone()
            }
        };
        if let Err(e) = self.publish_lease(&renewed).await {
            tracing::warn!("cluster: lease renewal failed: {}", e);
            return;
        }
        *self.lease.lock().unwrap() = Some(renewed);
        tracing::debug!("cluster: lease renewed, term={}", self.current_term());
    }

    async fn publish_lease(&self, lease: &Lease) -> Result<(), ControlError> {
        self.cache
            .set_json(&nskey("cluster", "lease"), lease, TtlClass::HighFrequency)
            .await
    }

    /// Voluntary or forced demotion.
    pub async fn step_down(&self, reason: &str) {
        let was_leader = {
            let mut role = self.role.lock().unwrap();
            let was = *role == NodeRole::Leader;
            *role = NodeRole::Follower;
            was
        };
        if was_leader {
            let mut lease = self.lease.lock().unwrap();
            if matches!(&*lease, Some(l) if l.leader_id == self.node_id) {
                *lease = None;
            }
        }
        metrics::gauge!("aether_cluster_is_leader").set(0.0);
        let _ = self.role_tx.send(NodeRole::Follower);
        tracing::warn!("cluster: stepped down, node={}, reason={}", self.node_id, reason);
    }

    // -- replication path --

    /// Leader-only: append an allocation record to the replicated sequence
    /// and push it to followers.
    pub async fn replicate_allocation(
        &self,
        allocation: &Allocation,
    ) -> Result<(), ControlError> {
        if !self.is_leader() {
            return Err(ControlError::NotLeader {
                leader: self.leader_address(),
            });
        }

        let term = self.current_term();
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let record = ReplicatedRecord {
            namespace: "allocations".to_string(),
            term,
            seq,
            payload: serde_json::to_value(allocation)
                .map_err(|e| ControlError::Internal(e.to_string()))?,
        };

        let key = nskey("allocations", &format!("{:012}-{:012}", term, seq));
        self.cache
            .set_json(&key, &record, TtlClass::Archival)
            .await?;

        let peers = self.peer_addresses();
        let pushes = peers.iter().map(|peer| {
            let record = record.clone();
            async move {
                if let Err(e) = self.transport.append(peer, &record).await {
                    tracing::debug!("cluster: append to {} failed: {}", peer, e);
                }
            }
        });
        join_all(pushes).await;
        Ok(())
    }

    /// Follower apply: strictly monotonic in `(term, seq)`.
    pub async fn handle_append(&self, record: ReplicatedRecord) -> Result<(), ControlError> {
        {
            let mut applied = self.last_applied.lock().unwrap();
            let incoming = (record.term, record.seq);
            if incoming <= *applied {
                return Ok(()); // duplicate or stale — already linearized
            }
            *applied = incoming;
        }

        let key = nskey(
            &record.namespace,
            &format!("{:012}-{:012}", record.term, record.seq),
        );
        self.cache
            .set_json(&key, &record, TtlClass::Archival)
            .await?;

        let sink = self.applied_tx.lock().unwrap().clone();
        if let Some(tx) = sink {
            if tx.send(record).await.is_err() {
                tracing::warn!("cluster: applied sink closed");
            }
        }
        Ok(())
    }

    /// Replay the replicated allocation log from the shared cache, in
    /// `(term, seq)` order, folding to the latest state per allocation.
    /// The new leader reconciles the marketplace from this.
    pub fn reconcile_allocations(&self) -> Vec<Allocation> {
        let mut records: Vec<ReplicatedRecord> = self
            .cache
            .scan_namespace("allocations")
            .into_iter()
            .filter_map(|(_, data)| serde_json::from_slice(&data).ok())
            .collect();
        records.sort_by_key(|r| (r.term, r.seq));

        let mut latest: HashMap<String, Allocation> = HashMap::new();
        for record in records {
            if let Ok(allocation) = serde_json::from_value::<Allocation>(record.payload) {
                latest.insert(allocation.id.clone(), allocation);
            }
        }
        let mut out: Vec<Allocation> = latest.into_values().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    fn peer_addresses(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.key() != &self.advertise_addr)
            .map(|n| n.key().clone())
            .collect()
    }
}

fn randomized_timeout(base_ms: u64) -> u64 {
    // ±20% avoids synchronized candidacies after a leader loss.
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    (base_ms as f64 * jitter) as u64
}

fn generate_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "node".to_string());
    format!("{}-{:08x}", host, rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn config(addr: &str, peers: &[&str], lease_ms: u64) -> ClusterConfig {
        ClusterConfig {
            node_id: Some(format!("node-{}", addr)),
            advertise_addr: addr.to_string(),
            peers: peers.iter().map(|s| s.to_string()).collect(),
            heartbeat_interval_ms: 10,
            failover_threshold: 3,
            lease_duration_ms: lease_ms,
            election_timeout_ms: 50,
        }
    }

    fn coordinator(
        addr: &str,
        peers: &[&str],
        transport: Arc<MemoryPeerTransport>,
        cache: Arc<TypedCache>,
    ) -> Arc<Coordinator> {
        let coordinator = Arc::new(Coordinator::new(
            config(addr, peers, 10_000),
            transport.clone(),
            cache,
        ));
        transport.register(addr, coordinator.clone());
        coordinator
    }

    fn shared_cache() -> Arc<TypedCache> {
        Arc::new(TypedCache::new(CacheConfig::default()))
    }

    fn three_nodes() -> (
        Arc<MemoryPeerTransport>,
        Arc<Coordinator>,
        Arc<Coordinator>,
        Arc<Coordinator>,
    ) {
        let transport = MemoryPeerTransport::new();
        let cache = shared_cache();
        let a = coordinator("a:1", &["b:1", "c:1"], transport.clone(), cache.clone());
        let b = coordinator("b:1", &["a:1", "c:1"], transport.clone(), cache.clone());
        let c = coordinator("c:1", &["a:1", "b:1"], transport.clone(), cache);
        (transport, a, b, c)
    }

    #[tokio::test]
    async fn test_single_node_elects_itself() {
        let transport = MemoryPeerTransport::new();
        let cache = shared_cache();
        let a = coordinator("a:1", &[], transport, cache);

        a.run_election().await;
        assert!(a.is_leader());
        assert_eq!(a.current_term(), 1);
    }

    #[tokio::test]
    async fn test_majority_election_with_three_nodes() {
        let (_t, a, b, c) = three_nodes();
        a.run_election().await;

        assert!(a.is_leader());
        assert_eq!(b.current_term(), 1);
        assert_eq!(c.current_term(), 1);
        assert_eq!(b.role(), NodeRole::Follower);
    }

    #[tokio::test]
    async fn test_vote_denied_while_lease_valid() {
        let (_t, a, b, _c) = three_nodes();
        a.run_election().await;
        a.heartbeat_tick().await; // gossip the lease to followers

        // B cannot win while A's lease is honored.
        b.run_election().await;
        assert!(!b.is_leader());
        assert!(a.is_leader());
    }

    #[tokio::test]
    async fn test_minority_candidate_loses() {
        let transport = MemoryPeerTransport::new();
        let cache = shared_cache();
        let a = coordinator("a:1", &["b:1", "c:1"], transport.clone(), cache);
        // b and c never registered → unreachable → only the self-vote.
        a.run_election().await;
        assert!(!a.is_leader());
        assert_eq!(a.role(), NodeRole::Follower);
    }

    #[tokio::test]
    async fn test_failover_after_leader_crash() {
        let (transport, a, b, c) = three_nodes();
        a.run_election().await;
        a.heartbeat_tick().await;
        assert!(a.is_leader());

        // Crash A and age everything out.
        transport.disconnect("a:1");
        let now = crate::cache::now_ms();
        for node in [&b, &c] {
            // Lease must lapse before anyone can win; simulate expiry.
            if let Some(mut lease) = node.current_lease() {
                lease.expires_at_ms = now.saturating_sub(1);
                *node.lease.lock().unwrap() = Some(lease);
            }
        }
        b.run_election().await;
        assert!(b.is_leader());
        assert!(b.current_term() > 1);

        // C yields to B's lease.
        b.heartbeat_tick().await;
        assert_eq!(c.leader_address().as_deref(), Some("b:1"));
    }

    #[tokio::test]
    async fn test_heartbeat_marks_silent_peers_failed() {
        let (_t, a, _b, _c) = three_nodes();
        // Nobody heartbeats; silence threshold is 30ms.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        a.heartbeat_tick().await;

        let failed = a
            .nodes_snapshot()
            .iter()
            .filter(|n| n.state == NodeState::Failed)
            .count();
        assert_eq!(failed, 2);
    }

    #[tokio::test]
    async fn test_degraded_leader_steps_down() {
        let transport = MemoryPeerTransport::new();
        let a = coordinator("a:1", &[], transport, shared_cache());
        a.run_election().await;
        assert!(a.is_leader());

        a.set_self_health(NodeState::Degraded);
        a.heartbeat_tick().await;
        assert!(!a.is_leader());
        assert_eq!(a.role(), NodeRole::Follower);
    }

    #[tokio::test]
    async fn test_replication_applies_in_order() {
        let (_t, a, b, _c) = three_nodes();
        a.run_election().await;

        let (tx, mut rx) = mpsc::channel(16);
        b.set_applied_sink(tx);

        let allocation = crate::market::Allocation {
            id: "alloc-1".into(),
            request_id: "r1".into(),
            tenant: "t1".into(),
            bandwidth_mbps: 200,
            spectrum_band: "mid".into(),
            frequency_range: crate::market::FrequencyRange {
                low_mhz: 2496.0,
                high_mhz: 2736.0,
            },
            power_dbm: 23.0,
            expires_at_ms: 0,
            channel_id: None,
            status: crate::market::AllocationStatus::Active,
        };
        a.replicate_allocation(&allocation).await.unwrap();
        a.replicate_allocation(&allocation).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.seq < second.seq);

        // A duplicate of an already-applied record is ignored.
        b.handle_append(first.clone()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_new_leader_reconciles_from_shared_log() {
        let (transport, a, b, _c) = three_nodes();
        a.run_election().await;

        let allocation = crate::market::Allocation {
            id: "alloc-1".into(),
            request_id: "r1".into(),
            tenant: "t1".into(),
            bandwidth_mbps: 200,
            spectrum_band: "mid".into(),
            frequency_range: crate::market::FrequencyRange {
                low_mhz: 2496.0,
                high_mhz: 2736.0,
            },
            power_dbm: 23.0,
            expires_at_ms: u64::MAX,
            channel_id: None,
            status: crate::market::AllocationStatus::Active,
        };
        a.replicate_allocation(&allocation).await.unwrap();

        transport.disconnect("a:1");
        let recovered = b.reconcile_allocations();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, "alloc-1");
    }

    #[tokio::test]
    async fn test_replicate_refused_on_follower() {
        let (_t, a, b, _c) = three_nodes();
        a.run_election().await;
        a.heartbeat_tick().await;

        let allocation = crate::market::Allocation {
            id: "x".into(),
            request_id: "r".into(),
            tenant: "t".into(),
            bandwidth_mbps: 1,
            spectrum_band: "mid".into(),
            frequency_range: crate::market::FrequencyRange {
                low_mhz: 0.0,
                high_mhz: 1.0,
            },
            power_dbm: 0.0,
            expires_at_ms: 0,
            channel_id: None,
            status: crate::market::AllocationStatus::Active,
        };
        let err = b.replicate_allocation(&allocation).await;
        assert!(matches!(err, Err(ControlError::NotLeader { .. })));
    }
}
