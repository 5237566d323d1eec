use crate::config::PoolConfig;
use crate::error::ControlError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// An opaque pooled backend handle. The transport it wraps is owned by the
/// collaborator behind the pool; the control plane only tracks identity and
/// age for reuse and staleness decisions.
#[derive(Debug)]
pub struct Handle {
    pub id: u64,
    pub class: String,
    created_at: Instant,
}

struct IdleEntry {
    handle: Handle,
    parked_at: Instant,
}

/// Scoped acquisition: the handle returns to the pool on drop, on every
/// exit path (success, failure, cancellation).
pub struct PoolGuard {
    pool: Arc<ConnectionPool>,
    handle: Option<Handle>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PoolGuard {
    pub fn handle(&self) -> &Handle {
        self.handle.as_ref().expect("guard holds a handle until drop")
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let (Some(handle), Some(permit)) = (self.handle.take(), self.permit.take()) {
            self.pool.release_internal(handle, permit);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub in_use: usize,
    pub idle: usize,
    pub waits: u64,
    pub timeouts: u64,
    pub force_released: u64,
}

/// Bounded pool for one backend class.
///
/// Live handles never exceed `max_size` (enforced by the semaphore). Idle
/// handles older than `idle_timeout` are discarded on the next acquire;
/// handles held longer than `operation_timeout` are treated as leaked by
/// the maintenance sweep, force-released and logged.
pub struct ConnectionPool {
    class: String,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleEntry>>,
    /// id → acquire time, for stale-handle detection.
    in_use: Mutex<HashMap<u64, Instant>>,
    /// ids force-released by maintenance while a guard still held them;
    /// the late-arriving guard must not return a second permit.
    revoked: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    waits: AtomicU64,
    timeouts: AtomicU64,
    force_released: AtomicU64,
}

impl ConnectionPool {
    pub fn new(class: &str, config: PoolConfig) -> Self {
        Self {
            class: class.to_string(),
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            config,
            idle: Mutex::new(VecDeque::new()),
            in_use: Mutex::new(HashMap::new()),
            revoked: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            waits: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            force_released: AtomicU64::new(0),
        }
    }

    /// Acquire a handle, blocking up to `acquire_timeout`.
    pub async fn acquire(self: &Arc<Self>) -> Result<PoolGuard, ControlError> {
        let timeout = Duration::from_millis(self.config.acquire_timeout_ms);

        let permit = if let Ok(p) = self.semaphore.clone().try_acquire_owned() {
            p
        } else {
            self.waits.fetch_add(1, Ordering::Relaxed);
            match tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned()).await {
                Ok(Ok(p)) => p,
                Ok(Err(_)) => {
                    return Err(ControlError::Internal(format!(
                        "pool {} semaphore closed",
                        self.class
                    )))
                }
                Err(_) => {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(
                        "aether_pool_acquire_timeouts_total",
                        "class" => self.class.clone(),
                    )
                    .increment(1);
                    return Err(ControlError::PoolExhausted {
                        class: self.class.clone(),
                    });
                }
            }
        };

        let handle = self.take_idle().unwrap_or_else(|| self.open_handle());
        self.in_use
            .lock()
            .unwrap()
            .insert(handle.id, Instant::now());
        self.publish_gauges();

        Ok(PoolGuard {
            pool: Arc::clone(self),
            handle: Some(handle),
            permit: Some(permit),
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            in_use: self.in_use.lock().unwrap().len(),
            idle: self.idle.lock().unwrap().len(),
            waits: self.waits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            force_released: self.force_released.load(Ordering::Relaxed),
        }
    }

    /// One maintenance pass: reclaim handles held beyond `operation_timeout`
    /// and lazily restore the idle floor.
    pub fn maintain(&self) {
        let op_timeout = Duration::from_millis(self.config.operation_timeout_ms);
        let stale: Vec<u64> = {
            let in_use = self.in_use.lock().unwrap();
            in_use
                .iter()
                .filter(|(_, at)| at.elapsed() > op_timeout)
                .map(|(id, _)| *id)
                .collect()
        };

        for id in stale {
            self.in_use.lock().unwrap().remove(&id);
            self.revoked.lock().unwrap().insert(id);
            // Compensate for the permit the leaked guard still holds.
            self.semaphore.add_permits(1);
            self.force_released.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "pool: force-released stale handle, class={}, id={}",
                self.class,
                id
            );
        }

        // Top the idle set back up to min_size.
        let in_use_len = self.in_use.lock().unwrap().len();
        {
            let mut idle = self.idle.lock().unwrap();
            while idle.len() < self.config.min_size
                && idle.len() + in_use_len < self.config.max_size
            {
                idle.push_back(IdleEntry {
                    handle: self.open_handle(),
                    parked_at: Instant::now(),
                });
            }
        }

        self.publish_gauges();
    }

    // -- private helpers --

    fn open_handle(&self) -> Handle {
        Handle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            class: self.class.clone(),
            created_at: Instant::now(),
        }
    }

    /// Pop the freshest idle handle, discarding any past `idle_timeout`.
    fn take_idle(&self) -> Option<Handle> {
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);
        let mut idle = self.idle.lock().unwrap();
        while let Some(entry) = idle.pop_back() {
            if entry.parked_at.elapsed() <= idle_timeout {
                return Some(entry.handle);
            }
            tracing::debug!(
                "pool: discarded idle handle, class={}, id={}, age={:?}",
                self.class,
                entry.handle.id,
                entry.handle.created_at.elapsed()
            );
        }
        None
    }

    fn release_internal(&self, handle: Handle, permit: OwnedSemaphorePermit) {
        {
            let mut revoked = self.revoked.lock().unwrap();
            if revoked.remove(&handle.id) {
                // Maintenance already re-added this permit; swallow ours.
                permit.forget();
                self.publish_gauges();
                return;
            }
        }

        self.in_use.lock().unwrap().remove(&handle.id);
        self.idle.lock().unwrap().push_back(IdleEntry {
            handle,
            parked_at: Instant::now(),
        });
        drop(permit);
        self.publish_gauges();
    }

    fn publish_gauges(&self) {
        let stats = self.stats();
        metrics::gauge!("aether_pool_in_use", "class" => self.class.clone())
            .set(stats.in_use as f64);
        metrics::gauge!("aether_pool_idle", "class" => self.class.clone())
            .set(stats.idle as f64);
    }
}

/// All pools, keyed by backend class.
pub struct PoolManager {
    pools: HashMap<String, Arc<ConnectionPool>>,
}

impl PoolManager {
    pub fn new(configs: &HashMap<String, PoolConfig>) -> Self {
        let pools = configs
            .iter()
            .map(|(class, cfg)| (class.clone(), Arc::new(ConnectionPool::new(class, cfg.clone()))))
            .collect();
        Self { pools }
    }

    pub async fn acquire(&self, class: &str) -> Result<PoolGuard, ControlError> {
        match self.pools.get(class) {
            Some(pool) => pool.acquire().await,
            None => Err(ControlError::InvalidArgument(format!(
                "unknown pool class '{}'",
                class
            ))),
        }
    }

    pub fn stats(&self) -> HashMap<String, PoolStats> {
        self.pools
            .iter()
            .map(|(class, pool)| (class.clone(), pool.stats()))
            .collect()
    }

    /// Spawn one maintenance loop per pool.
    pub fn start_maintenance(&self, shutdown: Arc<tokio::sync::Notify>) {
        for pool in self.pools.values() {
            let pool = Arc::clone(pool);
            let shutdown = shutdown.clone();
            let interval = Duration::from_millis(pool.config.maintenance_interval_ms);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => pool.maintain(),
                        _ = shutdown.notified() => return,
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_config(min: usize, max: usize, acquire_ms: u64) -> PoolConfig {
        PoolConfig {
            min_size: min,
            max_size: max,
            acquire_timeout_ms: acquire_ms,
            idle_timeout_ms: 60_000,
            operation_timeout_ms: 30_000,
            maintenance_interval_ms: 30_000,
        }
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_handle() {
        let pool = Arc::new(ConnectionPool::new("kv", pool_config(1, 4, 100)));
        let id = {
            let guard = pool.acquire().await.unwrap();
            guard.handle().id
        };
        let guard = pool.acquire().await.unwrap();
        assert_eq!(guard.handle().id, id, "released handle is reused");
    }

    #[tokio::test]
    async fn test_exhaustion_times_out() {
        let pool = Arc::new(ConnectionPool::new("kv", pool_config(0, 2, 50)));
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        let err = pool.acquire().await;
        assert!(matches!(err, Err(ControlError::PoolExhausted { .. })));
        assert_eq!(pool.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_release_unblocks_waiter() {
        let pool = Arc::new(ConnectionPool::new("kv", pool_config(0, 1, 500)));
        let guard = pool.acquire().await.unwrap();

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        let got = waiter.await.unwrap();
        assert!(got.is_ok());
    }

    #[tokio::test]
    async fn test_no_handle_held_by_two_guards() {
        let pool = Arc::new(ConnectionPool::new("kv", pool_config(0, 2, 100)));
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.handle().id, b.handle().id);
    }

    #[tokio::test]
    async fn test_stale_idle_handle_discarded() {
        let mut cfg = pool_config(0, 2, 100);
        cfg.idle_timeout_ms = 10;
        let pool = Arc::new(ConnectionPool::new("kv", cfg));
        let id = {
            let guard = pool.acquire().await.unwrap();
            guard.handle().id
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let guard = pool.acquire().await.unwrap();
        assert_ne!(guard.handle().id, id, "expired idle handle is replaced");
    }

    #[tokio::test]
    async fn test_maintenance_force_releases_stale_holder() {
        let mut cfg = pool_config(0, 1, 30);
        cfg.operation_timeout_ms = 10;
        let pool = Arc::new(ConnectionPool::new("kv", cfg));
        let leaked = pool.acquire().await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.maintain();
        assert_eq!(pool.stats().force_released, 1);

        // The pool has capacity again even though the leaked guard lives on.
        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.handle().id, leaked.handle().id);

        // Dropping the leaked guard must not double-add capacity.
        drop(leaked);
        drop(fresh);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await;
        drop(a);
        assert!(b.is_err(), "max_size 1 still bounds the pool");
    }

    #[tokio::test]
    async fn test_maintenance_restores_idle_floor() {
        let pool = Arc::new(ConnectionPool::new("kv", pool_config(2, 4, 100)));
        assert_eq!(pool.stats().idle, 0);
        pool.maintain();
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test]
    async fn test_manager_rejects_unknown_class() {
        let manager = PoolManager::new(&HashMap::new());
        let err = manager.acquire("nope").await;
        assert!(matches!(err, Err(ControlError::InvalidArgument(_))));
    }
}
