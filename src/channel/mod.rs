use crate::config::ChannelConfig;
use crate::error::ControlError;
use crate::metrics::{AlertCenter, Severity};
use crate::oracle::{CryptoOracle, SessionKeys};
use crate::pool::PoolManager;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Channel lifecycle:
///
/// ```text
///  (init) → establishing → live ⇄ suspect → dead → released
///                    │         │
///                    └─ failed ┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    Establishing,
    Live,
    Suspect,
    Dead,
    Failed,
    Released,
}

/// An authenticated, integrity-verified transport bound to one allocation.
/// Key material lives oracle-side; only the opaque handle is held here and
/// it is destroyed (oracle zeroizes) on release.
#[derive(Debug, Clone, Serialize)]
pub struct SecureChannel {
    pub id: String,
    pub allocation_id: String,
    pub crypto: SessionKeys,
    pub peer_endpoint: String,
    pub established_at_ms: u64,
    pub last_verified_at_ms: u64,
    pub state: ChannelState,
    /// Consecutive non-live verification results.
    strikes: u32,
    /// Set while the oracle cannot give an authoritative answer.
    suspect_since_ms: Option<u64>,
    /// Requests currently bound to the channel, drained on release.
    #[serde(skip)]
    outstanding: u32,
}

/// Work the marketplace asks of the channel manager.
#[derive(Debug)]
pub enum ChannelCommand {
    Establish {
        allocation_id: String,
        peer_endpoint: String,
    },
    Teardown {
        allocation_id: String,
    },
}

/// What the channel manager reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Established {
        allocation_id: String,
        channel_id: String,
    },
    EstablishFailed {
        allocation_id: String,
        reason: String,
    },
    IntegrityLost {
        allocation_id: String,
        channel_id: String,
    },
    Released {
        allocation_id: String,
        channel_id: String,
    },
}

/// Outcome of a single verification probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Suspect,
    Dead,
}

/// Establishes and curates secure channels.
///
/// The manager owns all channel state; the marketplace never mutates it and
/// learns of transitions exclusively through the bounded event queue wired
/// at startup. Establishment borrows a peer transport handle from the
/// `http_peer` pool for the duration of the handshake.
pub struct ChannelManager {
    config: ChannelConfig,
    oracle: Arc<dyn CryptoOracle>,
    pools: Arc<PoolManager>,
    alerts: Arc<AlertCenter>,
    channels: DashMap<String, SecureChannel>,
    by_allocation: DashMap<String, String>,
    events: mpsc::Sender<ChannelEvent>,
}

impl ChannelManager {
    pub fn new(
        config: ChannelConfig,
        oracle: Arc<dyn CryptoOracle>,
        pools: Arc<PoolManager>,
        alerts: Arc<AlertCenter>,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        Self {
            config,
            oracle,
            pools,
            alerts,
            channels: DashMap::new(),
            by_allocation: DashMap::new(),
            events,
        }
    }

    pub fn integrity_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.integrity_interval_ms)
    }

    /// Consume marketplace commands until the queue closes. The caller
    /// (bootstrap) owns the loop's lifetime.
    pub async fn run_commands(self: Arc<Self>, mut rx: mpsc::Receiver<ChannelCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                ChannelCommand::Establish {
                    allocation_id,
                    peer_endpoint,
                } => {
                    self.establish(&allocation_id, &peer_endpoint).await;
                }
                ChannelCommand::Teardown { allocation_id } => {
                    if let Some(channel_id) = self
                        .by_allocation
                        .get(&allocation_id)
                        .map(|e| e.value().clone())
                    {
                        self.release(&channel_id).await;
                    }
                }
            }
        }
        tracing::info!("channel: command queue closed, manager stopping");
    }

    /// Establish a channel for an allocation: session keys from the oracle,
    /// transport from the peer pool, then a signed liveness handshake.
    pub async fn establish(&self, allocation_id: &str, peer_endpoint: &str) {
        // An allocation gets exactly one channel; re-establishment retires
        // the predecessor first.
        if let Some(existing) = self
            .by_allocation
            .get(allocation_id)
            .map(|e| e.value().clone())
        {
            self.release(&existing).await;
        }

        let channel_id = format!("chan-{:012x}", rand::random::<u64>() & 0xffff_ffff_ffff);
        let now = crate::cache::now_ms();

        self.channels.insert(
            channel_id.clone(),
            SecureChannel {
                id: channel_id.clone(),
                allocation_id: allocation_id.to_string(),
                crypto: SessionKeys {
                    kem_id: String::new(),
                    sig_id: String::new(),
                    key_handle: String::new(),
                },
                peer_endpoint: peer_endpoint.to_string(),
                established_at_ms: now,
                last_verified_at_ms: now,
                state: ChannelState::Establishing,
                strikes: 0,
                suspect_since_ms: None,
                outstanding: 0,
            },
        );

        match self.handshake(&channel_id).await {
            Ok(keys) => {
                let now = crate::cache::now_ms();
                if let Some(mut chan) = self.channels.get_mut(&channel_id) {
                    chan.crypto = keys;
                    chan.state = ChannelState::Live;
                    chan.established_at_ms = now;
                    chan.last_verified_at_ms = now;
                }
                self.by_allocation
                    .insert(allocation_id.to_string(), channel_id.clone());
                metrics::gauge!("aether_channels_live").increment(1.0);
                tracing::info!(
                    "channel: established, channel={}, allocation={}, peer={}",
                    channel_id,
                    allocation_id,
                    peer_endpoint
                );
                self.emit(ChannelEvent::Established {
                    allocation_id: allocation_id.to_string(),
                    channel_id,
                })
                .await;
            }
            Err(e) => {
                // Failed is terminal; nothing references the channel, so
                // the record goes away with it.
                self.channels.remove(&channel_id);
                tracing::warn!(
                    "channel: establish failed, allocation={}, error={}",
                    allocation_id,
                    e
                );
                self.emit(ChannelEvent::EstablishFailed {
                    allocation_id: allocation_id.to_string(),
                    reason: e.to_string(),
                })
                .await;
            }
        }
    }

    async fn handshake(&self, channel_id: &str) -> Result<SessionKeys, ControlError> {
        // Hold a peer transport handle for the whole handshake.
        let _transport = self.pools.acquire("http_peer").await?;

        let keys = self.oracle.keygen().await?;
        let probe = format!("handshake:{}", channel_id);
        let signature = self.oracle.sign(&keys.key_handle, probe.as_bytes()).await?;
        let live = self
            .oracle
            .verify(&keys.key_handle, probe.as_bytes(), &signature)
            .await?;
        if !live {
            self.oracle.destroy(&keys.key_handle).await.ok();
            return Err(ControlError::Unavailable(
                "liveness handshake rejected".to_string(),
            ));
        }
        Ok(keys)
    }

    /// Probe one channel and apply the integrity discipline.
    pub async fn verify(&self, channel_id: &str) -> Verdict {
        let (key_handle, allocation_id, state) = match self.channels.get(channel_id) {
            Some(chan) => (
                chan.crypto.key_handle.clone(),
                chan.allocation_id.clone(),
                chan.state,
            ),
            None => return Verdict::Dead,
        };
        if !matches!(state, ChannelState::Live | ChannelState::Suspect) {
            return Verdict::Dead;
        }

        let probe = format!("verify:{}:{}", channel_id, crate::cache::now_ms());
        let verdict = match self.oracle.sign(&key_handle, probe.as_bytes()).await {
            Ok(signature) => match self
                .oracle
                .verify(&key_handle, probe.as_bytes(), &signature)
                .await
            {
                Ok(true) => Verdict::Ok,
                Ok(false) => Verdict::Dead,
                Err(_) => Verdict::Suspect,
            },
            Err(ControlError::InvalidArgument(_)) => Verdict::Dead,
            Err(_) => Verdict::Suspect,
        };

        self.apply_verdict(channel_id, &allocation_id, verdict).await;
        verdict
    }

    async fn apply_verdict(&self, channel_id: &str, allocation_id: &str, verdict: Verdict) {
        let now = crate::cache::now_ms();
        let grace_ms = self.config.integrity_interval_ms * 3;

        enum Outcome {
            None,
            Lost,
        }
        let outcome = {
            let Some(mut chan) = self.channels.get_mut(channel_id) else {
                return;
            };
            match verdict {
                Verdict::Ok => {
                    if chan.state == ChannelState::Suspect {
                        tracing::info!("channel: recovered, channel={}", channel_id);
                    }
                    chan.state = ChannelState::Live;
                    chan.strikes = 0;
                    chan.suspect_since_ms = None;
                    chan.last_verified_at_ms = now;
                    Outcome::None
                }
                Verdict::Dead => {
                    // Authoritative failure counts a strike.
                    chan.strikes += 1;
                    chan.state = ChannelState::Suspect;
                    metrics::counter!("aether_channel_integrity_failures_total").increment(1);
                    if chan.strikes >= 2 {
                        chan.state = ChannelState::Dead;
                        Outcome::Lost
                    } else {
                        Outcome::None
                    }
                }
                Verdict::Suspect => {
                    // Oracle unreachable: no strike, but the grace clock runs.
                    chan.state = ChannelState::Suspect;
                    let since = *chan.suspect_since_ms.get_or_insert(now);
                    metrics::counter!("aether_channel_integrity_failures_total").increment(1);
                    if now.saturating_sub(since) >= grace_ms {
                        chan.state = ChannelState::Dead;
                        Outcome::Lost
                    } else {
                        Outcome::None
                    }
                }
            }
        };

        if let Outcome::Lost = outcome {
            tracing::warn!(
                "channel: integrity lost, channel={}, allocation={}",
                channel_id,
                allocation_id
            );
            self.alerts
                .open_alert(
                    &format!("channel/{}", channel_id),
                    Severity::Error,
                    "channel_integrity",
                    0.0,
                    1.0,
                    now,
                )
                .await;
            self.emit(ChannelEvent::IntegrityLost {
                allocation_id: allocation_id.to_string(),
                channel_id: channel_id.to_string(),
            })
            .await;
            self.release(channel_id).await;
        }
    }

    /// Tear down every channel. Runs when this node loses the leader role;
    /// session keys are never replicated, so a successor re-establishes.
    pub async fn release_all(&self) {
        let ids: Vec<String> = self.channels.iter().map(|c| c.key().clone()).collect();
        for id in ids {
            self.release(&id).await;
        }
    }

    /// One verification round over every live or suspect channel.
    pub async fn verify_all(&self) {
        let ids: Vec<String> = self
            .channels
            .iter()
            .filter(|c| matches!(c.value().state, ChannelState::Live | ChannelState::Suspect))
            .map(|c| c.key().clone())
            .collect();
        for id in ids {
            self.verify(&id).await;
        }
    }

    /// Orderly teardown: drain outstanding work (bounded), destroy the key
    /// handle oracle-side, drop the channel, notify the marketplace.
    pub async fn release(&self, channel_id: &str) {
        let (allocation_id, key_handle, was_counted) = {
            let Some(mut chan) = self.channels.get_mut(channel_id) else {
                return;
            };
            if chan.state == ChannelState::Released {
                return;
            }
            let was_counted = matches!(
                chan.state,
                ChannelState::Live | ChannelState::Suspect | ChannelState::Dead
            );
            let info = (
                chan.allocation_id.clone(),
                chan.crypto.key_handle.clone(),
                was_counted,
            );
            chan.state = ChannelState::Released;
            info
        };

        self.drain(channel_id).await;

        if !key_handle.is_empty() {
            if let Err(e) = self.oracle.destroy(&key_handle).await {
                tracing::warn!(
                    "channel: key destroy failed, channel={}, error={}",
                    channel_id,
                    e
                );
            }
        }
        // Wipe the local copy of the handle.
        if let Some(mut chan) = self.channels.get_mut(channel_id) {
            chan.crypto.key_handle.clear();
        }

        self.by_allocation.remove(&allocation_id);
        self.channels.remove(channel_id);
        if was_counted {
            metrics::gauge!("aether_channels_live").decrement(1.0);
        }

        tracing::info!(
            "channel: released, channel={}, allocation={}",
            channel_id,
            allocation_id
        );
        self.emit(ChannelEvent::Released {
            allocation_id,
            channel_id: channel_id.to_string(),
        })
        .await;
    }

    /// Wait for outstanding bound requests to finish, up to `drain_timeout`.
    async fn drain(&self, channel_id: &str) {
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_millis(self.config.drain_timeout_ms);
        loop {
            let outstanding = self
                .channels
                .get(channel_id)
                .map(|c| c.outstanding)
                .unwrap_or(0);
            if outstanding == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "channel: drain timeout, channel={}, outstanding={}",
                    channel_id,
                    outstanding
                );
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Bind/complete accounting for requests using a channel.
    pub fn bind_request(&self, channel_id: &str) -> bool {
        match self.channels.get_mut(channel_id) {
            Some(mut chan) if chan.state == ChannelState::Live => {
                chan.outstanding += 1;
                true
            }
            _ => false,
        }
    }

    pub fn complete_request(&self, channel_id: &str) {
        if let Some(mut chan) = self.channels.get_mut(channel_id) {
            chan.outstanding = chan.outstanding.saturating_sub(1);
        }
    }

    pub fn channel_for_allocation(&self, allocation_id: &str) -> Option<SecureChannel> {
        let channel_id = self.by_allocation.get(allocation_id)?.value().clone();
        self.channels.get(&channel_id).map(|c| c.value().clone())
    }

    pub fn state_of(&self, channel_id: &str) -> Option<ChannelState> {
        self.channels.get(channel_id).map(|c| c.state)
    }

    pub fn live_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.state == ChannelState::Live)
            .count()
    }

    async fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).await.is_err() {
            tracing::warn!("channel: event queue closed, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlertsConfig, PoolConfig};
    use crate::metrics::Notifier;
    use crate::oracle::MemoryCryptoOracle;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    fn manager(
        oracle: Arc<MemoryCryptoOracle>,
        integrity_interval_ms: u64,
    ) -> (Arc<ChannelManager>, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let mut pools = HashMap::new();
        pools.insert("http_peer".to_string(), PoolConfig::default());
        let alerts = Arc::new(AlertCenter::new(
            &AlertsConfig::default(),
            Arc::new(Notifier::new(Vec::new())),
        ));
        let mgr = ChannelManager::new(
            crate::config::ChannelConfig {
                integrity_interval_ms,
                drain_timeout_ms: 100,
            },
            oracle,
            Arc::new(PoolManager::new(&pools)),
            alerts,
            tx,
        );
        (Arc::new(mgr), rx)
    }

    #[tokio::test]
    async fn test_establish_emits_established() {
        let (mgr, mut rx) = manager(Arc::new(MemoryCryptoOracle::new()), 60_000);
        mgr.establish("a1", "t1.tenants.aether").await;

        match rx.recv().await.unwrap() {
            ChannelEvent::Established {
                allocation_id,
                channel_id,
            } => {
                assert_eq!(allocation_id, "a1");
                assert_eq!(mgr.state_of(&channel_id), Some(ChannelState::Live));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(mgr.live_count(), 1);
    }

    #[tokio::test]
    async fn test_establish_failure_when_oracle_down() {
        let oracle = Arc::new(MemoryCryptoOracle::new());
        oracle.unreachable.store(true, Ordering::Relaxed);
        let (mgr, mut rx) = manager(oracle, 60_000);
        mgr.establish("a1", "peer").await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            ChannelEvent::EstablishFailed { .. }
        ));
        assert_eq!(mgr.live_count(), 0);
    }

    #[tokio::test]
    async fn test_two_strikes_promote_to_dead_and_release() {
        let oracle = Arc::new(MemoryCryptoOracle::new());
        let (mgr, mut rx) = manager(oracle.clone(), 60_000);
        mgr.establish("a1", "peer").await;
        let channel_id = match rx.recv().await.unwrap() {
            ChannelEvent::Established { channel_id, .. } => channel_id,
            other => panic!("unexpected event {:?}", other),
        };

        oracle.fail_verify.store(true, Ordering::Relaxed);
        assert_eq!(mgr.verify(&channel_id).await, Verdict::Dead);
        assert_eq!(mgr.state_of(&channel_id), Some(ChannelState::Suspect));

        assert_eq!(mgr.verify(&channel_id).await, Verdict::Dead);

        assert!(matches!(
            rx.recv().await.unwrap(),
            ChannelEvent::IntegrityLost { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ChannelEvent::Released { .. }
        ));
        assert!(mgr.state_of(&channel_id).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_oracle_marks_suspect_without_release() {
        let oracle = Arc::new(MemoryCryptoOracle::new());
        let (mgr, mut rx) = manager(oracle.clone(), 60_000);
        mgr.establish("a1", "peer").await;
        let channel_id = match rx.recv().await.unwrap() {
            ChannelEvent::Established { channel_id, .. } => channel_id,
            other => panic!("unexpected event {:?}", other),
        };

        oracle.unreachable.store(true, Ordering::Relaxed);
        assert_eq!(mgr.verify(&channel_id).await, Verdict::Suspect);
        assert_eq!(mgr.verify(&channel_id).await, Verdict::Suspect);
        assert_eq!(mgr.state_of(&channel_id), Some(ChannelState::Suspect));

        // Oracle returns: channel recovers.
        oracle.unreachable.store(false, Ordering::Relaxed);
        assert_eq!(mgr.verify(&channel_id).await, Verdict::Ok);
        assert_eq!(mgr.state_of(&channel_id), Some(ChannelState::Live));
    }

    #[tokio::test]
    async fn test_grace_expiry_promotes_suspect_to_dead() {
        let oracle = Arc::new(MemoryCryptoOracle::new());
        // 3x grace of a 10ms interval = 30ms.
        let (mgr, mut rx) = manager(oracle.clone(), 10);
        mgr.establish("a1", "peer").await;
        let channel_id = match rx.recv().await.unwrap() {
            ChannelEvent::Established { channel_id, .. } => channel_id,
            other => panic!("unexpected event {:?}", other),
        };

        oracle.unreachable.store(true, Ordering::Relaxed);
        assert_eq!(mgr.verify(&channel_id).await, Verdict::Suspect);
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        mgr.verify(&channel_id).await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            ChannelEvent::IntegrityLost { .. }
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_zeroizes() {
        let oracle = Arc::new(MemoryCryptoOracle::new());
        let (mgr, mut rx) = manager(oracle.clone(), 60_000);
        mgr.establish("a1", "peer").await;
        let channel_id = match rx.recv().await.unwrap() {
            ChannelEvent::Established { channel_id, .. } => channel_id,
            other => panic!("unexpected event {:?}", other),
        };
        let key_handle = mgr
            .channel_for_allocation("a1")
            .unwrap()
            .crypto
            .key_handle;

        mgr.release(&channel_id).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            ChannelEvent::Released { .. }
        ));
        // Destroyed handle can no longer sign.
        assert!(oracle.sign(&key_handle, b"x").await.is_err());

        // Second release is a no-op.
        mgr.release(&channel_id).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drain_waits_for_outstanding_work() {
        let oracle = Arc::new(MemoryCryptoOracle::new());
        let (mgr, mut rx) = manager(oracle, 60_000);
        mgr.establish("a1", "peer").await;
        let channel_id = match rx.recv().await.unwrap() {
            ChannelEvent::Established { channel_id, .. } => channel_id,
            other => panic!("unexpected event {:?}", other),
        };

        assert!(mgr.bind_request(&channel_id));
        let mgr2 = mgr.clone();
        let cid = channel_id.clone();
        let releaser = tokio::spawn(async move { mgr2.release(&cid).await });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        mgr.complete_request(&channel_id);
        releaser.await.unwrap();
        assert!(mgr.state_of(&channel_id).is_none());
    }
}
