use crate::cluster::{ClusterNode, Coordinator, Lease, ReplicatedRecord};
use crate::error::ControlError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Peer-to-peer RPC surface of the coordinator. HTTP in production; the
/// in-memory implementation wires coordinators directly for tests.
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    /// Ask `peer` for its vote. Returns whether the vote was granted.
    async fn request_vote(
        &self,
        peer: &str,
        candidate_id: &str,
        term: u64,
    ) -> Result<bool, ControlError>;

    /// Deliver a heartbeat carrying the sender's registry entry and the
    /// lease it currently honors.
    async fn heartbeat(
        &self,
        peer: &str,
        from: &ClusterNode,
        lease: Option<&Lease>,
    ) -> Result<(), ControlError>;

    /// Push a replicated record to a follower.
    async fn append(&self, peer: &str, record: &ReplicatedRecord) -> Result<(), ControlError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub candidate_id: String,
    pub term: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub granted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub from: ClusterNode,
    pub lease: Option<Lease>,
}

/// HTTP transport against peers' `/v1/cluster/…` endpoints.
pub struct HttpPeerTransport {
    client: reqwest::Client,
}

impl HttpPeerTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(2))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpPeerTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn http_err(e: reqwest::Error) -> ControlError {
    if e.is_timeout() {
        ControlError::Timeout(e.to_string())
    } else {
        ControlError::Unavailable(e.to_string())
    }
}

#[async_trait::async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn request_vote(
        &self,
        peer: &str,
        candidate_id: &str,
        term: u64,
    ) -> Result<bool, ControlError> {
        let resp = self
            .client
            .post(format!("http://{}/v1/cluster/vote", peer))
            .json(&VoteRequest {
                candidate_id: candidate_id.to_string(),
                term,
            })
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?
            .json::<VoteResponse>()
            .await
            .map_err(http_err)?;
        Ok(resp.granted)
    }

    async fn heartbeat(
        &self,
        peer: &str,
        from: &ClusterNode,
        lease: Option<&Lease>,
    ) -> Result<(), ControlError> {
        self.client
            .post(format!("http://{}/v1/cluster/heartbeat", peer))
            .json(&HeartbeatRequest {
                from: from.clone(),
                lease: lease.cloned(),
            })
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?;
        Ok(())
    }

    async fn append(&self, peer: &str, record: &ReplicatedRecord) -> Result<(), ControlError> {
        self.client
            .post(format!("http://{}/v1/cluster/append", peer))
            .json(record)
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?;
        Ok(())
    }
}

/// In-process transport: routes calls straight into peer coordinators.
/// Peers registered after construction; unknown addresses are unreachable,
/// which doubles as the crash-a-node lever in failover tests.
pub struct MemoryPeerTransport {
    peers: DashMap<String, Arc<Coordinator>>,
}

impl MemoryPeerTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: DashMap::new(),
        })
    }

    pub fn register(&self, address: &str, coordinator: Arc<Coordinator>) {
        self.peers.insert(address.to_string(), coordinator);
    }

    /// Simulate a crash: the address stops resolving.
    pub fn disconnect(&self, address: &str) {
        self.peers.remove(address);
    }

    fn peer(&self, address: &str) -> Result<Arc<Coordinator>, ControlError> {
        self.peers
            .get(address)
            .map(|e| e.value().clone())
            .ok_or_else(|| ControlError::Unavailable(format!("peer {} unreachable", address)))
    }
}

#[async_trait::async_trait]
impl PeerTransport for MemoryPeerTransport {
    async fn request_vote(
        &self,
        peer: &str,
        candidate_id: &str,
        term: u64,
    ) -> Result<bool, ControlError> {
        Ok(self.peer(peer)?.handle_vote_request(candidate_id, term))
    }

    async fn heartbeat(
        &self,
        peer: &str,
        from: &ClusterNode,
        lease: Option<&Lease>,
    ) -> Result<(), ControlError> {
        self.peer(peer)?.handle_heartbeat(from.clone(), lease.cloned());
        Ok(())
    }

    async fn append(&self, peer: &str, record: &ReplicatedRecord) -> Result<(), ControlError> {
        self.peer(peer)?.handle_append(record.clone()).await
    }
}
