use crate::config::BreakerConfig;
use crate::error::ControlError;
use crate::resilience::breaker::{Admission, BreakerRegistry};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Retry wrapper around the breaker registry.
///
/// One `call` makes up to `max_attempts` attempts with exponential backoff
/// plus uniform jitter, all bounded by the overall `call_timeout` deadline
/// (the fallback included). Every attempt asks the breaker for admission
/// first and reports its outcome back; a short-circuit surfaces as
/// `CircuitOpen` and is never retried within the same call.
pub struct Retrier {
    breakers: Arc<BreakerRegistry>,
    config: BreakerConfig,
}

impl Retrier {
    pub fn new(breakers: Arc<BreakerRegistry>, config: BreakerConfig) -> Self {
        Self { breakers, config }
    }

    /// Run `op` against `resource` under breaker + retry + deadline.
    pub async fn call<T, F, Fut>(&self, resource: &str, op: F) -> Result<T, ControlError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ControlError>>,
    {
        self.call_inner(resource, op, None::<fn() -> Fut>).await
    }

    /// As `call`, but invoke `fallback` once after retries are exhausted.
    /// The fallback never fires for `InvalidArgument`/`Unauthorized` and is
    /// bounded by whatever remains of the overall deadline.
    pub async fn call_with_fallback<T, F, Fut, FB, FutB>(
        &self,
        resource: &str,
        op: F,
        fallback: FB,
    ) -> Result<T, ControlError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ControlError>>,
        FB: Fn() -> FutB,
        FutB: Future<Output = Result<T, ControlError>>,
    {
        self.call_inner(resource, op, Some(fallback)).await
    }

    async fn call_inner<T, F, Fut, FB, FutB>(
        &self,
        resource: &str,
        op: F,
        fallback: Option<FB>,
    ) -> Result<T, ControlError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ControlError>>,
        FB: Fn() -> FutB,
        FutB: Future<Output = Result<T, ControlError>>,
    {
        let deadline = Instant::now() + Duration::from_millis(self.config.call_timeout_ms);
        let mut last_err: ControlError;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match self.breakers.admit(resource) {
                Admission::Attempt | Admission::Probe => {}
                Admission::ShortCircuit => {
                    metrics::counter!(
                        "aether_breaker_rejected_total",
                        "resource" => resource.to_string(),
                    )
                    .increment(1);
                    // Short-circuited calls are not retried and not counted.
                    last_err = ControlError::CircuitOpen {
                        resource: resource.to_string(),
                    };
                    break;
                }
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => {
                    // The admitted slot never ran; close it out as a timeout.
                    last_err = ControlError::Timeout(format!("{} deadline exceeded", resource));
                    self.breakers.observe(resource, Some(&last_err));
                    break;
                }
            };

            let result = match tokio::time::timeout(remaining, op()).await {
                Ok(r) => r,
                Err(_) => Err(ControlError::Timeout(format!(
                    "{} attempt timed out",
                    resource
                ))),
            };

            match result {
                Ok(value) => {
                    self.breakers.observe(resource, None);
                    return Ok(value);
                }
                Err(err) => {
                    self.breakers.observe(resource, Some(&err));

                    let retryable = err.is_retryable()
                        && attempt < self.config.max_attempts
                        && Instant::now() < deadline;
                    last_err = err;
                    if !retryable {
                        break;
                    }

                    metrics::counter!(
                        "aether_retry_attempts_total",
                        "resource" => resource.to_string(),
                    )
                    .increment(1);
                    let delay = self.backoff_delay(attempt, deadline);
                    if delay.is_zero() {
                        last_err =
                            ControlError::Timeout(format!("{} deadline exceeded", resource));
                        break;
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // Exhausted. Fallback fires once, for everything except caller bugs.
        if let Some(fallback) = fallback {
            if !matches!(
                last_err,
                ControlError::InvalidArgument(_) | ControlError::Unauthorized(_)
            ) {
                let remaining = deadline
                    .checked_duration_since(Instant::now())
                    .unwrap_or(Duration::from_millis(1));
                return match tokio::time::timeout(remaining, fallback()).await {
                    Ok(result) => result,
                    Err(_) => Err(ControlError::Timeout(format!(
                        "{} fallback timed out",
                        resource
                    ))),
                };
            }
        }

        Err(last_err)
    }

    /// `min(max_delay, initial * base^attempt)` plus uniform jitter of up to
    /// half the computed delay, clamped to the remaining deadline.
    fn backoff_delay(&self, attempt: u32, deadline: Instant) -> Duration {
        let exp = self.config.backoff_base.powi(attempt.saturating_sub(1) as i32);
        let base_ms = ((self.config.initial_delay_ms as f64) * exp)
            .min(self.config.max_delay_ms as f64) as u64;
        let jitter = rand::thread_rng().gen_range(0..=base_ms / 2 + 1);
        let delay = Duration::from_millis(base_ms + jitter);

        match deadline.checked_duration_since(Instant::now()) {
            Some(remaining) if remaining > delay => delay,
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn retrier(cfg: BreakerConfig) -> Retrier {
        Retrier::new(Arc::new(BreakerRegistry::new(cfg.clone())), cfg)
    }

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout_ms: 60_000,
            probe_count: 1,
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_base: 2.0,
            call_timeout_ms: 2000,
        }
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let r = retrier(fast_config());
        let out: Result<u32, _> = r.call("res", || async { Ok(42) }).await;
        assert_eq!(out.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retries_retryable_errors() {
        let r = retrier(fast_config());
        let calls = AtomicU32::new(0);
        let out = r
            .call("res", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ControlError::Unavailable("flaky".into()))
                } else {
                    Ok("done")
                }
            })
            .await;
        assert_eq!(out.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_bypass_retry() {
        let r = retrier(fast_config());
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = r
            .call("res", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ControlError::InvalidArgument("bad".into()))
            })
            .await;
        assert!(matches!(out, Err(ControlError::InvalidArgument(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits_without_invoking_op() {
        let cfg = fast_config();
        let r = retrier(cfg);
        // One exhausted call reports three Unavailable outcomes, which is
        // exactly the failure threshold.
        let _ = r
            .call::<(), _, _>("res", || async {
                Err(ControlError::Unavailable("down".into()))
            })
            .await;

        let calls = AtomicU32::new(0);
        let out: Result<(), _> = r
            .call("res", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(out, Err(ControlError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "inner op must not run");
    }

    #[tokio::test]
    async fn test_fallback_fires_once_after_exhaustion() {
        let r = retrier(fast_config());
        let fallbacks = AtomicU32::new(0);
        let out = r
            .call_with_fallback(
                "res2",
                || async { Err(ControlError::Unavailable("down".into())) },
                || async {
                    fallbacks.fetch_add(1, Ordering::SeqCst);
                    Ok("cached")
                },
            )
            .await;
        assert_eq!(out.unwrap(), "cached");
        assert_eq!(fallbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_skipped_for_invalid_argument() {
        let r = retrier(fast_config());
        let out: Result<&str, _> = r
            .call_with_fallback(
                "res3",
                || async { Err(ControlError::InvalidArgument("bad".into())) },
                || async { Ok("cached") },
            )
            .await;
        assert!(matches!(out, Err(ControlError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_overall_deadline_yields_timeout() {
        let mut cfg = fast_config();
        cfg.call_timeout_ms = 30;
        cfg.max_attempts = 10;
        let r = retrier(cfg);
        let out: Result<(), _> = r
            .call("res4", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(matches!(out, Err(ControlError::Timeout(_))));
    }
}
