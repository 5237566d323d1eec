use crate::cache::{nskey, TtlClass, TypedCache};
use crate::config::{RateLimitSection, RateRuleConfig};
use crate::error::ControlError;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Admission decision for one `check` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Deny { retry_after_ms: u64 },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// Keyed rate limiter with two algorithms.
///
/// - Token bucket: `capacity` tokens refilled at `refill_rate`/s, computed
///   lazily from the clock delta on access.
/// - Leaky bucket: sliding-window count, blending the previous window to
///   avoid the boundary-burst artifact of fixed windows.
///
/// Rules are declarative and resolved per key: an exact rule wins, then the
/// key's prefix before `:`, then the default rule. Rules marked
/// `distributed` round-trip the bucket record through the shared cache with
/// compare-and-set so the limit holds cluster-wide; when the cache is
/// unreachable the limiter falls back to its local bucket and records
/// `aether_ratelimit_degraded_total`.
///
/// Per-key state that has not been touched for `GC_EXPIRE_SECS` is evicted
/// periodically, with a hard entry cap force-evicting the oldest beyond it.
pub struct RateLimiter {
    rules: RateLimitSection,
    buckets: DashMap<String, Arc<Bucket>>,
    windows: DashMap<String, Arc<SlidingWindow>>,
    cache: Option<Arc<TypedCache>>,
}

/// Token bucket — `tokio::sync::Mutex`-protected so waiting yields back to
/// the runtime instead of blocking the worker thread. A CAS-only design
/// under-refills under contention: only the CAS winner adds tokens.
struct Bucket {
    inner: Mutex<BucketInner>,
    last_access: AtomicU64,
}

struct BucketInner {
    tokens: u64,
    last_refill: u64,
    rate_per_us: f64,
    max_tokens: u64,
}

struct SlidingWindow {
    inner: Mutex<SlidingWindowInner>,
    last_access: AtomicU64,
}

struct SlidingWindowInner {
    current_count: u64,
    prev_count: u64,
    window_start: u64,
    max_count: u64,
    window_us: u64,
}

/// Bucket record round-tripped through the cache in distributed mode.
#[derive(Debug, Serialize, Deserialize)]
struct SharedBucket {
    /// Scaled by `PRECISION`.
    tokens: u64,
    last_refill_ms: u64,
}

const PRECISION: u64 = 1_000_000;

/// Entries untouched this long are eligible for eviction.
const GC_EXPIRE_SECS: u64 = 300;
const GC_INTERVAL_SECS: u64 = 60;
/// Hard cap on tracked keys per map.
const MAX_ENTRIES: usize = 100_000;
/// CAS attempts against the shared cache before falling back locally.
const CAS_ATTEMPTS: u32 = 3;

impl RateLimiter {
    pub fn new(rules: RateLimitSection) -> Self {
        Self {
            rules,
            buckets: DashMap::new(),
            windows: DashMap::new(),
            cache: None,
        }
    }

    /// Attach the shared cache used by `distributed` rules.
    pub fn with_cache(rules: RateLimitSection, cache: Arc<TypedCache>) -> Self {
        let mut limiter = Self::new(rules);
        limiter.cache = Some(cache);
        limiter
    }

    /// Resolve the rule for a key: exact match, then prefix before `:`,
    /// then the default.
    pub fn rule_for(&self, key: &str) -> &RateRuleConfig {
        if let Some(rule) = self.rules.rules.get(key) {
            return rule;
        }
        if let Some((prefix, _)) = key.split_once(':') {
            if let Some(rule) = self.rules.rules.get(prefix) {
                return rule;
            }
        }
        &self.rules.default
    }

    /// Check whether `n` units of work keyed by `key` are admitted.
    pub async fn check(&self, key: &str, n: u64) -> Decision {
        let rule = self.rule_for(key).clone();

        let mut shared_decision = None;
        if rule.distributed {
            if let Some(cache) = self.cache.clone() {
                match self.check_shared(&cache, &rule, key, n).await {
                    Ok(decision) => shared_decision = Some(decision),
                    Err(e) => {
                        tracing::warn!(
                            "ratelimit: shared check degraded to local, key={}, error={}",
                            key,
                            e
                        );
                        metrics::counter!("aether_ratelimit_degraded_total").increment(1);
                    }
                }
            }
        }

        let decision = match shared_decision {
            Some(decision) => decision,
            None => match rule.algorithm.as_str() {
                "leaky_bucket" => self.check_sliding_window(&rule, key, n).await,
                _ => self.check_token_bucket(&rule, key, n).await,
            },
        };

        match &decision {
            Decision::Admit => {
                metrics::counter!("aether_ratelimit_allowed_total", "key" => key.to_string())
                    .increment(1);
            }
            Decision::Deny { .. } => {
                metrics::counter!("aether_ratelimit_rejected_total", "key" => key.to_string())
                    .increment(1);
            }
        }
        decision
    }

    async fn check_token_bucket(&self, rule: &RateRuleConfig, key: &str, n: u64) -> Decision {
        let max_tokens = rule.capacity * PRECISION;
        let rate_per_us = rule.refill_rate / 1_000_000.0;

        // Fast path: key already exists — no allocation.
        let bucket = if let Some(entry) = self.buckets.get(key) {
            entry.value().clone()
        } else {
            self.buckets
                .entry(key.to_string())
                .or_insert_with(|| {
                    let now = now_us();
                    Arc::new(Bucket {
                        inner: Mutex::new(BucketInner {
                            tokens: max_tokens,
                            last_refill: now,
                            rate_per_us,
                            max_tokens,
                        }),
                        last_access: AtomicU64::new(now),
                    })
                })
                .clone()
        };

        bucket.last_access.store(now_us(), Ordering::Relaxed);
        bucket.try_acquire(n, rule.refill_rate).await
    }

    async fn check_sliding_window(&self, rule: &RateRuleConfig, key: &str, n: u64) -> Decision {
        let window = if let Some(entry) = self.windows.get(key) {
            entry.value().clone()
        } else {
            self.windows
                .entry(key.to_string())
                .or_insert_with(|| {
                    let now = now_us();
                    Arc::new(SlidingWindow {
                        inner: Mutex::new(SlidingWindowInner {
                            current_count: 0,
                            prev_count: 0,
                            window_start: now,
                            max_count: rule.capacity,
                            window_us: rule.window_ms * 1000,
                        }),
                        last_access: AtomicU64::new(now),
                    })
                })
                .clone()
        };

        window.last_access.store(now_us(), Ordering::Relaxed);
        window.try_acquire(n, rule.window_ms).await
    }

    /// Distributed token bucket: read-modify-CAS the record in the shared
    /// cache. Conflicts retry a few times; persistent conflict or an
    /// unreachable cache falls back to the local bucket.
    async fn check_shared(
        &self,
        cache: &TypedCache,
        rule: &RateRuleConfig,
        key: &str,
        n: u64,
    ) -> Result<Decision, ControlError> {
        let cache_key = nskey("ratelimit", key);
        let cost = n * PRECISION;
        let max_tokens = rule.capacity * PRECISION;

        for _ in 0..CAS_ATTEMPTS {
            let existing: Option<SharedBucket> = cache.get_json(&cache_key).await?;
            let version = cache.version(&cache_key);
            let now = crate::cache::now_ms();

            let mut record = existing.unwrap_or(SharedBucket {
                tokens: max_tokens,
                last_refill_ms: now,
            });

            let elapsed_ms = now.saturating_sub(record.last_refill_ms);
            if elapsed_ms > 0 {
                let refill = (elapsed_ms as f64 / 1000.0 * rule.refill_rate
                    * PRECISION as f64) as u64;
                record.tokens = (record.tokens + refill).min(max_tokens);
                record.last_refill_ms = now;
            }

            let admitted = record.tokens >= cost;
            if admitted {
                record.tokens -= cost;
            }

            let data = serde_json::to_vec(&record)
                .map_err(|e| ControlError::Internal(e.to_string()))?;
            match cache
                .compare_and_swap(&cache_key, version, Bytes::from(data), TtlClass::HighFrequency)
                .await
            {
                Ok(_) => {
                    return Ok(if admitted {
                        Decision::Admit
                    } else {
                        Decision::Deny {
                            retry_after_ms: retry_after_ms(cost - record.tokens, rule.refill_rate),
                        }
                    });
                }
                Err(ControlError::CacheUnavailable(msg)) => {
                    return Err(ControlError::CacheUnavailable(msg));
                }
                Err(_) => continue, // version conflict — reread and retry
            }
        }

        Err(ControlError::Unavailable(
            "shared bucket cas contention".to_string(),
        ))
    }

    /// Spawn the periodic eviction of stale per-key state.
    pub fn start_gc(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                limiter.evict_stale();
            }
        });
    }

    fn evict_stale(&self) {
        let now = now_us();
        let expire_us = GC_EXPIRE_SECS * 1_000_000;

        self.buckets
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);
        if self.buckets.len() > MAX_ENTRIES {
            force_evict(&self.buckets, now, |b| &b.last_access);
        }

        self.windows
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);
        if self.windows.len() > MAX_ENTRIES {
            force_evict(&self.windows, now, |w| &w.last_access);
        }
    }
}

/// Force-evict the oldest entries until the map is at or below `MAX_ENTRIES`.
fn force_evict<V, F>(map: &DashMap<String, Arc<V>>, now: u64, access: F)
where
    F: Fn(&V) -> &AtomicU64,
{
    let overflow = map.len().saturating_sub(MAX_ENTRIES);
    if overflow == 0 {
        return;
    }
    let mut entries: Vec<(String, u64)> = map
        .iter()
        .map(|r| {
            let age = now.saturating_sub(access(r.value()).load(Ordering::Relaxed));
            (r.key().clone(), age)
        })
        .collect();
    entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
    for (key, _) in entries.into_iter().take(overflow) {
        map.remove(&key);
    }
}

fn retry_after_ms(missing_scaled: u64, refill_rate: f64) -> u64 {
    if refill_rate <= 0.0 {
        return 1000;
    }
    let missing = missing_scaled as f64 / PRECISION as f64;
    ((missing / refill_rate) * 1000.0).ceil() as u64
}

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

impl Bucket {
    async fn try_acquire(&self, n: u64, refill_rate: f64) -> Decision {
        let now = now_us();
        let mut b = self.inner.lock().await;

        let elapsed = now.saturating_sub(b.last_refill);
        if elapsed > 0 {
            let refill = (elapsed as f64 * b.rate_per_us * PRECISION as f64) as u64;
            b.tokens = (b.tokens + refill).min(b.max_tokens);
            b.last_refill = now;
        }

        let cost = n * PRECISION;
        if b.tokens >= cost {
            b.tokens -= cost;
            Decision::Admit
        } else {
            Decision::Deny {
                retry_after_ms: retry_after_ms(cost - b.tokens, refill_rate),
            }
        }
    }
}

impl SlidingWindow {
    async fn try_acquire(&self, n: u64, window_ms: u64) -> Decision {
        let now = now_us();
        let mut w = self.inner.lock().await;

        // Advance windows; a long idle gap may skip several.
        while now.saturating_sub(w.window_start) >= w.window_us {
            w.prev_count = w.current_count;
            w.current_count = 0;
            w.window_start += w.window_us;
        }
        if now.saturating_sub(w.window_start) >= w.window_us {
            w.prev_count = 0;
        }

        // Blend the previous window by its remaining overlap.
        let elapsed_in_window = now.saturating_sub(w.window_start);
        let weight = if w.window_us > 0 {
            1.0 - (elapsed_in_window as f64 / w.window_us as f64)
        } else {
            0.0
        };
        let estimated = (w.prev_count as f64 * weight) as u64 + w.current_count;

        if estimated + n <= w.max_count {
            w.current_count += n;
            Decision::Admit
        } else {
            Decision::Deny {
                retry_after_ms: (w.window_us - elapsed_in_window) / 1000,
            }
        }
    }
}
