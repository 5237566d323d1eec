use crate::error::{correlation_id, ControlError};
use crate::market::{Allocation, AllocationStatus, BandwidthRequest, Decision};
use crate::metrics::MetricType;
use crate::server::ControlState;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long an accepted submission may wait for its channel to come up
/// before the decision is returned with the allocation still pending.
const ACTIVATION_WAIT: Duration = Duration::from_millis(450);

/// Per-operation context derived from the transport layer.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub tenant: String,
    pub token: Option<String>,
    pub correlation_id: String,
}

impl OperationContext {
    pub fn new(tenant: &str, token: Option<String>) -> Self {
        Self {
            tenant: tenant.to_string(),
            token,
            correlation_id: correlation_id(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NodeStatusReport {
    pub node_id: String,
    pub role: String,
    pub term: u64,
    pub health: String,
    pub active_leases: usize,
    pub pool_stats: HashMap<String, crate::pool::PoolStats>,
    pub cache_stats: crate::cache::CacheStats,
}

#[derive(Debug, Serialize)]
pub struct SystemHealthReport {
    pub overall: String,
    pub components: Vec<crate::health::ComponentHealth>,
    pub open_alerts: Vec<crate::metrics::Alert>,
}

/// The outward-facing composition of the control plane.
///
/// Every mutating operation runs the same pipeline:
/// authenticate → rate-limit → leader-check → breaker-protected business
/// call → metrics. Reads skip the leader check and serve from the local
/// replica.
#[derive(Clone)]
pub struct Orchestrator {
    state: ControlState,
}

impl Orchestrator {
    pub fn new(state: ControlState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    /// Admit a bandwidth request and wait briefly for channel establishment.
    pub async fn allocate_bandwidth(
        &self,
        ctx: &OperationContext,
        request: BandwidthRequest,
    ) -> Result<Decision, ControlError> {
        let started = Instant::now();
        let result = self.allocate_inner(ctx, request).await;
        self.finish(ctx, "allocate", started, &result.as_ref().err());
        result
    }

    async fn allocate_inner(
        &self,
        ctx: &OperationContext,
        request: BandwidthRequest,
    ) -> Result<Decision, ControlError> {
        self.authenticate(ctx)?;
        self.admit_rate(ctx).await?;
        self.require_leader()?;

        let market = self.state.market.clone();
        let req = request.clone();
        let decision = self
            .state
            .retrier
            .call("market/submit", move || {
                let market = market.clone();
                let req = req.clone();
                async move { market.submit(req).await }
            })
            .await?;

        let Some(allocation) = decision.allocation.clone() else {
            return Ok(decision);
        };

        let settled = self.wait_for_activation(&allocation.id).await;
        if let Some(current) = &settled {
            self.state
                .coordinator
                .replicate_allocation(current)
                .await
                .ok();
        }

        Ok(Decision {
            allocation: settled.or(Some(allocation)),
            ..decision
        })
    }

    /// Release an allocation. Idempotent.
    pub async fn release_bandwidth(
        &self,
        ctx: &OperationContext,
        allocation_id: &str,
    ) -> Result<(), ControlError> {
        let started = Instant::now();
        let result = self.release_inner(ctx, allocation_id).await;
        self.finish(ctx, "release", started, &result.as_ref().err());
        result
    }

    async fn release_inner(
        &self,
        ctx: &OperationContext,
        allocation_id: &str,
    ) -> Result<(), ControlError> {
        self.authenticate(ctx)?;
        self.admit_rate(ctx).await?;
        self.require_leader()?;

        let market = self.state.market.clone();
        let id = allocation_id.to_string();
        self.state
            .retrier
            .call("market/release", move || {
                let market = market.clone();
                let id = id.clone();
                async move { market.release(&id).await }
            })
            .await?;

        if let Some(current) = self.state.market.get(allocation_id) {
            self.state
                .coordinator
                .replicate_allocation(&current)
                .await
                .ok();
        }
        Ok(())
    }

    /// Extend an active allocation's lease.
    pub async fn renew_bandwidth(
        &self,
        ctx: &OperationContext,
        allocation_id: &str,
        new_expiry_ms: u64,
    ) -> Result<(), ControlError> {
        let started = Instant::now();
        let result = async {
            self.authenticate(ctx)?;
            self.admit_rate(ctx).await?;
            self.require_leader()?;
            self.state.market.renew(allocation_id, new_expiry_ms)?;
            if let Some(current) = self.state.market.get(allocation_id) {
                self.state
                    .coordinator
                    .replicate_allocation(&current)
                    .await
                    .ok();
            }
            Ok(())
        }
        .await;
        self.finish(ctx, "renew", started, &result.as_ref().err());
        result
    }

    /// Read path: works on any node from the local replica.
    pub fn list_active_allocations(&self) -> Vec<Allocation> {
        self.state.market.list_active()
    }

    pub fn capacity(&self) -> HashMap<String, (u64, u64)> {
        self.state.market.capacity()
    }

    pub fn node_status(&self) -> NodeStatusReport {
        let coordinator = &self.state.coordinator;
        NodeStatusReport {
            node_id: coordinator.node_id().to_string(),
            role: coordinator.role().as_str().to_string(),
            term: coordinator.current_term(),
            health: self.state.health.overall().as_str().to_string(),
            active_leases: self.state.market.list_active().len(),
            pool_stats: self.state.pools.stats(),
            cache_stats: self.state.cache.stats(),
        }
    }

    pub async fn system_health(&self) -> SystemHealthReport {
        SystemHealthReport {
            overall: self.state.health.overall().as_str().to_string(),
            components: self.state.health.components(),
            open_alerts: self.state.alerts.open_alerts().await,
        }
    }

    // -- pipeline stages --

    fn authenticate(&self, ctx: &OperationContext) -> Result<(), ControlError> {
        let config = self.state.config.load();
        if config.auth.tokens.is_empty() {
            return Ok(()); // authentication disabled
        }
        let expected = config.auth.tokens.get(&ctx.tenant);
        match (expected, &ctx.token) {
            (Some(expected), Some(got)) if expected == got => Ok(()),
            _ => Err(ControlError::Unauthorized(format!(
                "tenant {} credential rejected",
                ctx.tenant
            ))),
        }
    }

    async fn admit_rate(&self, ctx: &OperationContext) -> Result<(), ControlError> {
        let key = format!("tenant:{}", ctx.tenant);
        match self.state.limiter.check(&key, 1).await {
            crate::ratelimit::Decision::Admit => Ok(()),
            crate::ratelimit::Decision::Deny { retry_after_ms } => {
                Err(ControlError::RateLimited { retry_after_ms })
            }
        }
    }

    fn require_leader(&self) -> Result<(), ControlError> {
        if self.state.coordinator.is_leader() {
            return Ok(());
        }
        metrics::counter!("aether_cluster_forwarded_total").increment(1);
        Err(ControlError::NotLeader {
            leader: self.state.coordinator.leader_address(),
        })
    }

    /// Poll the allocation until it leaves `Pending` or the wait elapses.
    async fn wait_for_activation(&self, allocation_id: &str) -> Option<Allocation> {
        let deadline = Instant::now() + ACTIVATION_WAIT;
        loop {
            match self.state.market.get(allocation_id) {
                Some(a) if a.status != AllocationStatus::Pending => return Some(a),
                Some(a) if Instant::now() >= deadline => return Some(a),
                None => return None,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    }

    fn finish(
        &self,
        ctx: &OperationContext,
        operation: &'static str,
        started: Instant,
        error: &Option<&ControlError>,
    ) {
        let elapsed = started.elapsed();
        metrics::counter!("aether_requests_total", "operation" => operation).increment(1);
        metrics::histogram!("aether_request_duration_seconds", "operation" => operation)
            .record(elapsed.as_secs_f64());

        self.state.series.record_now(
            "market_latency_ms",
            elapsed.as_millis() as f64,
            MetricType::Histogram,
        );

        match error {
            Some(err) => {
                metrics::counter!("aether_errors_total", "kind" => err.kind()).increment(1);
                // Client-attributable denials are not marketplace faults.
                let fault = !matches!(
                    err,
                    ControlError::NotLeader { .. }
                        | ControlError::RateLimited { .. }
                        | ControlError::Unauthorized(_)
                        | ControlError::InvalidArgument(_)
                );
                self.state.series.record_now(
                    "market_error_rate",
                    if fault { 1.0 } else { 0.0 },
                    MetricType::Gauge,
                );
                tracing::warn!(
                    "orchestrator: {} failed, tenant={}, correlation_id={}, kind={}, error={}",
                    operation,
                    ctx.tenant,
                    ctx.correlation_id,
                    err.kind(),
                    err
                );
            }
            None => {
                self.state
                    .series
                    .record_now("market_error_rate", 0.0, MetricType::Gauge);
                tracing::debug!(
                    "orchestrator: {} ok, tenant={}, correlation_id={}, elapsed_ms={}",
                    operation,
                    ctx.tenant,
                    ctx.correlation_id,
                    elapsed.as_millis()
                );
            }
        }
    }
}
