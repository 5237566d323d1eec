pub mod spectrum;

pub use spectrum::{BandSnapshot, SpectrumPool};

use crate::channel::{ChannelCommand, ChannelEvent};
use crate::config::MarketConfig;
use crate::error::ControlError;
use crate::oracle::{Forecaster, NameService, NetworkState};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QosRequirements {
    pub max_latency_ms: u64,
    pub min_reliability: f64,
}

/// A tenant's request for bandwidth. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthRequest {
    pub id: String,
    pub tenant: String,
    pub bandwidth_mbps: u64,
    pub duration_s: u64,
    pub qos: QosRequirements,
    pub priority: u8,
    #[serde(default)]
    pub submitted_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStatus {
    Pending,
    Active,
    Releasing,
    Released,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyRange {
    pub low_mhz: f64,
    pub high_mhz: f64,
}

impl FrequencyRange {
    pub fn overlaps(&self, other: &FrequencyRange) -> bool {
        self.low_mhz < other.high_mhz && other.low_mhz < self.high_mhz
    }
}

/// An accepted commitment to serve a request for a bounded time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub request_id: String,
    pub tenant: String,
    pub bandwidth_mbps: u64,
    pub spectrum_band: String,
    pub frequency_range: FrequencyRange,
    pub power_dbm: f64,
    pub expires_at_ms: u64,
    pub channel_id: Option<String>,
    pub status: AllocationStatus,
}

/// Outcome of `submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub accepted: bool,
    pub allocation: Option<Allocation>,
    pub reason: Option<String>,
}

impl Decision {
    fn accept(allocation: Allocation) -> Self {
        Self {
            accepted: true,
            allocation: Some(allocation),
            reason: None,
        }
    }

    fn reject(reason: &str) -> Self {
        Self {
            accepted: false,
            allocation: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// The bandwidth marketplace: admission, lease lifecycle and reclamation.
///
/// Owns every `Allocation` and the spectrum table. Channel establishment
/// and teardown are delegated to the channel manager over the bounded
/// command queue; transitions come back over the event queue. Decisions are
/// cached by request id so a duplicate submission returns the original
/// outcome instead of double-allocating.
pub struct Marketplace {
    config: MarketConfig,
    pool: SpectrumPool,
    forecaster: Arc<dyn Forecaster>,
    names: Arc<dyn NameService>,
    allocations: DashMap<String, Allocation>,
    decisions: DashMap<String, Decision>,
    channel_cmds: std::sync::Mutex<Option<mpsc::Sender<ChannelCommand>>>,
}

impl Marketplace {
    pub fn new(
        config: MarketConfig,
        forecaster: Arc<dyn Forecaster>,
        names: Arc<dyn NameService>,
    ) -> Self {
        let pool = SpectrumPool::new(&config.bands);
        Self {
            config,
            pool,
            forecaster,
            names,
            allocations: DashMap::new(),
            decisions: DashMap::new(),
            channel_cmds: std::sync::Mutex::new(None),
        }
    }

    /// Wire the channel-manager command queue. Without one (stripped-down
    /// deployments and unit tests) accepted allocations activate
    /// immediately.
    pub fn set_channel_sender(&self, tx: mpsc::Sender<ChannelCommand>) {
        *self.channel_cmds.lock().unwrap() = Some(tx);
    }

    pub fn cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.cleanup_interval_ms)
    }

    /// Admit or reject a request.
    pub async fn submit(&self, mut request: BandwidthRequest) -> Result<Decision, ControlError> {
        validate(&request)?;
        if request.submitted_at_ms == 0 {
            request.submitted_at_ms = crate::cache::now_ms();
        }

        // A client-supplied request id makes resubmission idempotent.
        if let Some(previous) = self.decisions.get(&request.id) {
            tracing::debug!("market: duplicate submission, request={}", request.id);
            return Ok(previous.value().clone());
        }

        let decision = self.admit(&request).await;

        match &decision {
            Ok(d) if d.accepted => {
                metrics::counter!("aether_allocations_total", "outcome" => "accepted")
                    .increment(1);
            }
            Ok(_) => {
                metrics::counter!("aether_allocations_total", "outcome" => "rejected")
                    .increment(1);
            }
            Err(_) => {}
        }

        if let Ok(d) = &decision {
            self.decisions.insert(request.id.clone(), d.clone());
        }
        decision
    }

    async fn admit(&self, request: &BandwidthRequest) -> Result<Decision, ControlError> {
        let candidates = self.pool.candidates(request.bandwidth_mbps, &request.qos);

        if candidates.is_empty() {
            return if self.pool.qos_feasible(&request.qos) {
                tracing::info!(
                    "market: rejected, request={}, reason=capacity, mbps={}",
                    request.id,
                    request.bandwidth_mbps
                );
                Ok(Decision::reject("capacity_exhausted"))
            } else {
                tracing::info!(
                    "market: rejected, request={}, reason=qos, max_latency_ms={}, min_reliability={}",
                    request.id,
                    request.qos.max_latency_ms,
                    request.qos.min_reliability
                );
                Ok(Decision::reject("qos_infeasible"))
            };
        }

        // Candidates are best-fit ordered; take the first whose projected
        // load keeps the safety margin free.
        for band in &candidates {
            if !self.projection_keeps_margin(band, request).await {
                tracing::debug!(
                    "market: projection breaches margin, request={}, band={}",
                    request.id,
                    band.name
                );
                continue;
            }

            let allocation_id =
                format!("alloc-{:012x}", rand::random::<u64>() & 0xffff_ffff_ffff);
            let Some((range, power)) =
                self.pool
                    .commit(&band.name, &allocation_id, request.bandwidth_mbps)
            else {
                continue; // raced with a concurrent commit — next candidate
            };

            let allocation = Allocation {
                id: allocation_id.clone(),
                request_id: request.id.clone(),
                tenant: request.tenant.clone(),
                bandwidth_mbps: request.bandwidth_mbps,
                spectrum_band: band.name.clone(),
                frequency_range: range,
                power_dbm: power,
                expires_at_ms: request.submitted_at_ms + request.duration_s * 1000,
                channel_id: None,
                status: AllocationStatus::Pending,
            };
            self.allocations
                .insert(allocation_id.clone(), allocation.clone());

            tracing::info!(
                "market: accepted, request={}, allocation={}, band={}, mbps={}, expires_at={}",
                request.id,
                allocation_id,
                band.name,
                request.bandwidth_mbps,
                allocation.expires_at_ms
            );

            self.request_channel(&allocation).await;
            // Reread: with no channel manager wired the allocation already
            // activated inline.
            let current = self
                .allocations
                .get(&allocation_id)
                .map(|a| a.value().clone())
                .unwrap_or(allocation);
            return Ok(Decision::accept(current));
        }

        Ok(Decision::reject("capacity_exhausted"))
    }

    /// Rule: the forecaster's projected load plus this request must leave
    /// at least `safety_margin` of the band free over the lease duration.
    async fn projection_keeps_margin(
        &self,
        band: &BandSnapshot,
        request: &BandwidthRequest,
    ) -> bool {
        let state = NetworkState {
            total_mbps: band.capacity_mbps,
            allocated_mbps: band.allocated_mbps,
            active_allocations: band.active_assignments,
        };
        let projected = match self.forecaster.predict(&state, request.duration_s).await {
            Ok(p) => p.projected_load_mbps,
            Err(e) => {
                // An unavailable forecaster falls back to present load.
                tracing::warn!("market: forecaster unavailable, error={}", e);
                band.allocated_mbps as f64
            }
        };
        let reserved = self.config.safety_margin * band.capacity_mbps as f64;
        let projected_free =
            band.capacity_mbps as f64 - (projected + request.bandwidth_mbps as f64);
        projected_free >= reserved
    }

    async fn request_channel(&self, allocation: &Allocation) {
        let sender = self.channel_cmds.lock().unwrap().clone();
        match sender {
            Some(tx) => {
                let peer_endpoint = self
                    .names
                    .resolve(&format!("tenant/{}", allocation.tenant))
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| format!("{}.tenants.aether", allocation.tenant));
                let cmd = ChannelCommand::Establish {
                    allocation_id: allocation.id.clone(),
                    peer_endpoint,
                };
                if tx.send(cmd).await.is_err() {
                    tracing::error!(
                        "market: channel command queue closed, failing allocation={}",
                        allocation.id
                    );
                    self.fail_allocation(&allocation.id);
                }
            }
            None => {
                if let Some(mut entry) = self.allocations.get_mut(&allocation.id) {
                    entry.status = AllocationStatus::Active;
                }
            }
        }
    }

    /// Apply a channel-manager event. Called by the event pump.
    pub async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Established {
                allocation_id,
                channel_id,
            } => {
                if let Some(mut entry) = self.allocations.get_mut(&allocation_id) {
                    match entry.status {
                        AllocationStatus::Pending => {
                            entry.status = AllocationStatus::Active;
                            entry.channel_id = Some(channel_id);
                            tracing::info!(
                                "market: allocation active, allocation={}",
                                allocation_id
                            );
                        }
                        // Re-established after a leader change: adopt the
                        // fresh channel.
                        AllocationStatus::Active => {
                            entry.channel_id = Some(channel_id);
                        }
                        _ => {}
                    }
                }
            }
            ChannelEvent::EstablishFailed {
                allocation_id,
                reason,
            } => {
                tracing::warn!(
                    "market: channel establish failed, allocation={}, reason={}",
                    allocation_id,
                    reason
                );
                self.fail_allocation(&allocation_id);
            }
            ChannelEvent::IntegrityLost {
                allocation_id,
                channel_id,
            } => {
                tracing::warn!(
                    "market: integrity lost, allocation={}, channel={}",
                    allocation_id,
                    channel_id
                );
                self.fail_allocation(&allocation_id);
            }
            ChannelEvent::Released { allocation_id, .. } => {
                if let Some(mut entry) = self.allocations.get_mut(&allocation_id) {
                    if entry.status == AllocationStatus::Releasing {
                        entry.status = AllocationStatus::Released;
                        entry.channel_id = None;
                    }
                }
            }
        }
    }

    fn fail_allocation(&self, allocation_id: &str) {
        let failed = match self.allocations.get_mut(allocation_id) {
            Some(mut entry)
                if matches!(
                    entry.status,
                    AllocationStatus::Pending | AllocationStatus::Active
                ) =>
            {
                entry.status = AllocationStatus::Failed;
                entry.channel_id = None;
                true
            }
            _ => false,
        };
        if failed {
            self.pool.release(allocation_id);
            metrics::counter!("aether_allocations_total", "outcome" => "failed").increment(1);
        }
    }

    /// Release an allocation. Idempotent after the first success.
    pub async fn release(&self, allocation_id: &str) -> Result<(), ControlError> {
        let previous = match self.allocations.get_mut(allocation_id) {
            Some(mut entry) => {
                let status = entry.status;
                if matches!(
                    status,
                    AllocationStatus::Active | AllocationStatus::Pending
                ) {
                    entry.status = AllocationStatus::Releasing;
                }
                status
            }
            None => {
                return Err(ControlError::InvalidArgument(format!(
                    "unknown allocation {}",
                    allocation_id
                )))
            }
        };

        match previous {
            AllocationStatus::Active | AllocationStatus::Pending => {
                self.pool.release(allocation_id);
                self.send_teardown(allocation_id).await;
                tracing::info!("market: releasing, allocation={}", allocation_id);
                Ok(())
            }
            // Already on its way out, or gone: report success without
            // touching state.
            AllocationStatus::Releasing
            | AllocationStatus::Released
            | AllocationStatus::Failed => Ok(()),
        }
    }

    async fn send_teardown(&self, allocation_id: &str) {
        let sender = self.channel_cmds.lock().unwrap().clone();
        match sender {
            Some(tx) => {
                let cmd = ChannelCommand::Teardown {
                    allocation_id: allocation_id.to_string(),
                };
                if tx.send(cmd).await.is_err() {
                    tracing::warn!("market: channel command queue closed on teardown");
                }
            }
            None => {
                if let Some(mut entry) = self.allocations.get_mut(allocation_id) {
                    entry.status = AllocationStatus::Released;
                }
            }
        }
    }

    /// Extend an active allocation's lease.
    pub fn renew(&self, allocation_id: &str, new_expiry_ms: u64) -> Result<(), ControlError> {
        match self.allocations.get_mut(allocation_id) {
            Some(mut entry) => {
                if entry.status != AllocationStatus::Active {
                    return Err(ControlError::InvalidArgument(format!(
                        "allocation {} is not active",
                        allocation_id
                    )));
                }
                if new_expiry_ms <= entry.expires_at_ms {
                    return Err(ControlError::InvalidArgument(
                        "new expiry must extend the lease".to_string(),
                    ));
                }
                entry.expires_at_ms = new_expiry_ms;
                tracing::info!(
                    "market: renewed, allocation={}, expires_at={}",
                    allocation_id,
                    new_expiry_ms
                );
                Ok(())
            }
            None => Err(ControlError::InvalidArgument(format!(
                "unknown allocation {}",
                allocation_id
            ))),
        }
    }

    pub fn list_active(&self) -> Vec<Allocation> {
        let mut active: Vec<Allocation> = self
            .allocations
            .iter()
            .filter(|a| {
                matches!(
                    a.status,
                    AllocationStatus::Active | AllocationStatus::Releasing
                )
            })
            .map(|a| a.value().clone())
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    pub fn get(&self, allocation_id: &str) -> Option<Allocation> {
        self.allocations.get(allocation_id).map(|a| a.value().clone())
    }

    /// Per-band `(total, free)` capacity in mbps.
    pub fn capacity(&self) -> HashMap<String, (u64, u64)> {
        self.pool.capacity()
    }

    /// Reclaim expired leases. Runs on the cleanup timer; idempotent.
    pub async fn sweep(&self, now_ms: u64) {
        let expired: Vec<String> = self
            .allocations
            .iter()
            .filter(|a| {
                matches!(
                    a.status,
                    AllocationStatus::Active | AllocationStatus::Pending
                ) && a.expires_at_ms <= now_ms
            })
            .map(|a| a.id.clone())
            .collect();

        for allocation_id in expired {
            tracing::info!("market: lease expired, allocation={}", allocation_id);
            if self.release(&allocation_id).await.is_ok() {
                metrics::counter!("aether_allocations_expired_total").increment(1);
            }
        }

        // Drop records whose terminal state is older than the decision
        // cache needs.
        self.allocations.retain(|_, a| {
            !matches!(
                a.status,
                AllocationStatus::Released | AllocationStatus::Failed
            ) || a.expires_at_ms + 3_600_000 > now_ms
        });
    }

    // -- replication support --

    /// Everything a follower needs to mirror, and a new leader to rebuild.
    pub fn export_allocations(&self) -> Vec<Allocation> {
        let mut all: Vec<Allocation> = self
            .allocations
            .iter()
            .map(|a| a.value().clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Install replicated allocation state wholesale, rebuilding the
    /// spectrum table from the active records. Used on leader takeover.
    pub fn reconcile(&self, allocations: Vec<Allocation>) {
        self.allocations.clear();
        self.pool.clear();
        for allocation in allocations {
            if matches!(
                allocation.status,
                AllocationStatus::Active | AllocationStatus::Pending
            ) {
                let ok = self.pool.restore(
                    &allocation.spectrum_band,
                    &allocation.id,
                    allocation.frequency_range.clone(),
                    allocation.bandwidth_mbps,
                );
                if !ok {
                    tracing::error!(
                        "market: reconcile found conflicting spectrum, allocation={}",
                        allocation.id
                    );
                    continue;
                }
            }
            self.allocations.insert(allocation.id.clone(), allocation);
        }
        tracing::info!(
            "market: reconciled replicated state, allocations={}",
            self.allocations.len()
        );
    }

    /// Mirror a single replicated record (follower apply path).
    pub fn apply_replicated(&self, allocation: Allocation) {
        self.allocations.insert(allocation.id.clone(), allocation);
    }

    /// Ask the channel manager for a fresh channel on every active
    /// allocation. Session keys are process-local, so a new leader cannot
    /// adopt its predecessor's channels — it re-establishes them.
    pub async fn restore_channels(&self) {
        let active: Vec<Allocation> = self
            .allocations
            .iter()
            .filter(|a| a.status == AllocationStatus::Active)
            .map(|a| a.value().clone())
            .collect();
        for allocation in active {
            self.request_channel(&allocation).await;
        }
    }
}

fn validate(request: &BandwidthRequest) -> Result<(), ControlError> {
    if request.id.is_empty() {
        return Err(ControlError::InvalidArgument("request id is empty".into()));
    }
    if request.tenant.is_empty() {
        return Err(ControlError::InvalidArgument("tenant is empty".into()));
    }
    if request.bandwidth_mbps == 0 {
        return Err(ControlError::InvalidArgument(
            "bandwidth_mbps must be positive".into(),
        ));
    }
    if request.duration_s == 0 {
        return Err(ControlError::InvalidArgument(
            "duration_s must be positive".into(),
        ));
    }
    if !(0.0..=1.0).contains(&request.qos.min_reliability) {
        return Err(ControlError::InvalidArgument(
            "min_reliability must be in [0, 1]".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{FixedForecaster, MemoryNameService, Prediction, TrendForecaster};

    fn market() -> Marketplace {
        Marketplace::new(
            MarketConfig::default(),
            Arc::new(TrendForecaster),
            Arc::new(MemoryNameService::new()),
        )
    }

    fn request(id: &str, mbps: u64) -> BandwidthRequest {
        BandwidthRequest {
            id: id.to_string(),
            tenant: "t1".to_string(),
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

    #[tokio::test]
    async fn test_accept_activates_without_channel_manager() {
        let market = market();
        let decision = market.submit(request("r1", 200)).await.unwrap();
        assert!(decision.accepted);
        let allocation = decision.allocation.unwrap();
        assert_eq!(allocation.spectrum_band, "mid");
        assert_eq!(allocation.status, AllocationStatus::Active);
        assert_eq!(market.capacity()["mid"].1, 800);
    }

    #[tokio::test]
    async fn test_capacity_exhaustion_honors_safety_margin() {
        // mid band: 1000 total, margin 0.10 → at most 900 admitted.
        let market = market();
        assert!(market.submit(request("r1", 400)).await.unwrap().accepted);
        assert!(market.submit(request("r2", 400)).await.unwrap().accepted);

        let third = market.submit(request("r3", 400)).await.unwrap();
        assert!(!third.accepted);
        assert_eq!(third.reason.as_deref(), Some("capacity_exhausted"));
    }

    #[tokio::test]
    async fn test_qos_infeasible_distinct_from_capacity() {
        let market = market();
        let mut req = request("r1", 100);
        req.qos.max_latency_ms = 1; // tighter than any band's latency class
        let decision = market.submit(req).await.unwrap();
        assert!(!decision.accepted);
        assert_eq!(decision.reason.as_deref(), Some("qos_infeasible"));
    }

    #[tokio::test]
    async fn test_duplicate_request_id_returns_original_decision() {
        let market = market();
        let first = market.submit(request("r1", 200)).await.unwrap();
        let second = market.submit(request("r1", 200)).await.unwrap();
        assert_eq!(
            first.allocation.as_ref().unwrap().id,
            second.allocation.as_ref().unwrap().id
        );
        // Only one allocation's worth of spectrum is held.
        assert_eq!(market.capacity()["mid"].1, 800);
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_returns_spectrum() {
        let market = market();
        let decision = market.submit(request("r1", 200)).await.unwrap();
        let id = decision.allocation.unwrap().id;

        market.release(&id).await.unwrap();
        assert_eq!(market.capacity()["mid"].1, 1000);
        market.release(&id).await.unwrap();
        assert_eq!(market.capacity()["mid"].1, 1000);

        assert!(market.release("alloc-bogus").await.is_err());
    }

    #[tokio::test]
    async fn test_renew_extends_only_active_forward() {
        let market = market();
        let decision = market.submit(request("r1", 200)).await.unwrap();
        let allocation = decision.allocation.unwrap();

        let later = allocation.expires_at_ms + 60_000;
        market.renew(&allocation.id, later).unwrap();
        assert_eq!(market.get(&allocation.id).unwrap().expires_at_ms, later);

        // Backwards renewal is refused.
        assert!(market.renew(&allocation.id, later - 1).is_err());

        market.release(&allocation.id).await.unwrap();
        assert!(market.renew(&allocation.id, later + 60_000).is_err());
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired_leases() {
        let market = market();
        let mut req = request("r1", 200);
        req.duration_s = 1;
        req.submitted_at_ms = 1000;
        let decision = market.submit(req).await.unwrap();
        let id = decision.allocation.unwrap().id;

        // Not yet expired.
        market.sweep(1500).await;
        assert_eq!(market.list_active().len(), 1);

        market.sweep(10_000).await;
        let allocation = market.get(&id).unwrap();
        assert!(matches!(
            allocation.status,
            AllocationStatus::Releasing | AllocationStatus::Released
        ));
        assert_eq!(market.capacity()["mid"].1, 1000);
    }

    #[tokio::test]
    async fn test_forecast_breach_rejects() {
        // Forecaster projects the band already fully loaded.
        let market = Marketplace::new(
            MarketConfig::default(),
            Arc::new(FixedForecaster {
                prediction: Prediction {
                    projected_load_mbps: 950.0,
                    confidence: 0.99,
                },
            }),
            Arc::new(MemoryNameService::new()),
        );
        let decision = market.submit(request("r1", 100)).await.unwrap();
        assert!(!decision.accepted);
    }

    #[tokio::test]
    async fn test_establish_failure_returns_spectrum() {
        let market = market();
        let decision = market.submit(request("r1", 200)).await.unwrap();
        let id = decision.allocation.unwrap().id;

        market
            .handle_channel_event(ChannelEvent::EstablishFailed {
                allocation_id: id.clone(),
                reason: "oracle down".into(),
            })
            .await;

        assert_eq!(market.get(&id).unwrap().status, AllocationStatus::Failed);
        assert_eq!(market.capacity()["mid"].1, 1000);
    }

    #[tokio::test]
    async fn test_reconcile_rebuilds_spectrum() {
        let market = market();
        let decision = market.submit(request("r1", 300)).await.unwrap();
        let exported = market.export_allocations();
        assert_eq!(exported.len(), 1);

        let fresh = Marketplace::new(
            MarketConfig::default(),
            Arc::new(TrendForecaster),
            Arc::new(MemoryNameService::new()),
        );
        fresh.reconcile(exported);
        assert_eq!(fresh.capacity()["mid"].1, 700);
        assert_eq!(
            fresh.list_active()[0].id,
            decision.allocation.unwrap().id
        );
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected_eagerly() {
        let market = market();
        let mut req = request("", 200);
        assert!(market.submit(req.clone()).await.is_err());
        req.id = "r1".into();
        req.bandwidth_mbps = 0;
        assert!(market.submit(req).await.is_err());
    }

    #[tokio::test]
    async fn test_active_allocations_disjoint_in_band() {
        let market = market();
        let a = market.submit(request("r1", 300)).await.unwrap();
        let b = market.submit(request("r2", 300)).await.unwrap();
        let (a, b) = (a.allocation.unwrap(), b.allocation.unwrap());
        if a.spectrum_band == b.spectrum_band {
            assert!(!a.frequency_range.overlaps(&b.frequency_range));
        }
    }
}
