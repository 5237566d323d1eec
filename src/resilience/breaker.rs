use crate::config::BreakerConfig;
use crate::error::ControlError;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Admission verdict for one call against a protected resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The breaker is closed; attempt the call.
    Attempt,
    /// The breaker is sampling recovery; this call is one of the probes.
    Probe,
    /// The breaker is open; short-circuit with `CircuitOpen`.
    ShortCircuit,
}

/// Lifecycle phase of one breaker. Each phase carries exactly the
/// bookkeeping that is meaningful in it, so a counter can never leak
/// across transitions.
enum Phase {
    /// Calls flow freely; a streak of counted failures trips the breaker.
    Closed { failures: u32 },
    /// Calls are refused until the cooldown elapses.
    Open { since: Instant },
    /// A bounded set of probes samples the resource. One failed probe
    /// re-opens; a full set of successes closes.
    HalfOpen { launched: u32, succeeded: u32 },
}

/// Per-`(resource, operation_class)` circuit breakers, keyed by strings
/// like `"crypto_oracle/keygen"` or `"peer:10.0.0.2:7400/append"`.
///
/// The registry owns error classification: callers report every completed
/// call through [`observe`] and the breaker decides what counts. Streaks
/// advance only on the kinds the taxonomy marks breaker-relevant
/// (`Timeout`, `Unavailable`, `Internal`), and a rejection that a breaker
/// itself produced is discarded outright, so an open breaker can never
/// feed its own failure count.
///
/// [`observe`]: BreakerRegistry::observe
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<Mutex<Phase>>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Decide whether a call against `resource` may go ahead. An open
    /// breaker whose cooldown has elapsed flips to half-open here and
    /// hands this caller the first probe slot.
    pub fn admit(&self, resource: &str) -> Admission {
        let slot = self.slot(resource);
        let mut phase = slot.lock().unwrap();
        match &mut *phase {
            Phase::Closed { .. } => Admission::Attempt,
            Phase::Open { since } => {
                if since.elapsed() < Duration::from_millis(self.config.reset_timeout_ms) {
                    return Admission::ShortCircuit;
                }
                tracing::info!("breaker: cooldown over, probing, resource={}", resource);
                *phase = Phase::HalfOpen {
                    launched: 1,
                    succeeded: 0,
                };
                Admission::Probe
            }
            Phase::HalfOpen { launched, .. } => {
                if *launched < self.config.probe_count {
                    *launched += 1;
                    Admission::Probe
                } else {
                    // Probe budget spent; hold further traffic until the
                    // outstanding probes report back.
                    Admission::ShortCircuit
                }
            }
        }
    }

    /// Report the outcome of a call previously admitted for `resource`.
    /// Pass `None` on success; the registry applies the taxonomy itself,
    /// so callers never pre-filter errors.
    pub fn observe(&self, resource: &str, error: Option<&ControlError>) {
        // A breaker-originated rejection is neither evidence of health nor
        // of failure.
        if matches!(error, Some(ControlError::CircuitOpen { .. })) {
            return;
        }
        let failed = error.map_or(false, |e| e.counts_as_breaker_failure());

        let slot = self.slot(resource);
        let mut phase = slot.lock().unwrap();
        match (&mut *phase, failed) {
            (Phase::Closed { failures }, false) => {
                *failures = 0;
            }
            (Phase::Closed { failures }, true) => {
                *failures += 1;
                let streak = *failures;
                metrics::counter!(
                    "aether_breaker_failures_total",
                    "resource" => resource.to_string(),
                )
                .increment(1);
                if streak >= self.config.failure_threshold {
                    tracing::warn!(
                        "breaker: tripped, resource={}, failures={}",
                        resource,
                        streak
                    );
                    *phase = Phase::Open {
                        since: Instant::now(),
                    };
                }
            }
            (Phase::HalfOpen { succeeded, .. }, false) => {
                *succeeded += 1;
                if *succeeded >= self.config.probe_count {
                    tracing::info!(
                        "breaker: recovered, resource={}, probes={}",
                        resource,
                        succeeded
                    );
                    *phase = Phase::Closed { failures: 0 };
                }
            }
            (Phase::HalfOpen { .. }, true) => {
                metrics::counter!(
                    "aether_breaker_failures_total",
                    "resource" => resource.to_string(),
                )
                .increment(1);
                tracing::warn!(
                    "breaker: probe failed, cooling down again, resource={}",
                    resource
                );
                *phase = Phase::Open {
                    since: Instant::now(),
                };
            }
            // An outcome from before the trip; the cooldown already governs.
            (Phase::Open { .. }, _) => {}
        }
    }

    /// Phase label for status reporting.
    pub fn state(&self, resource: &str) -> &'static str {
        match &*self.slot(resource).lock().unwrap() {
            Phase::Closed { .. } => "closed",
            Phase::Open { .. } => "open",
            Phase::HalfOpen { .. } => "half_open",
        }
    }

    fn slot(&self, resource: &str) -> Arc<Mutex<Phase>> {
        if let Some(entry) = self.breakers.get(resource) {
            return entry.value().clone();
        }
        self.breakers
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Phase::Closed { failures: 0 })))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(failure_threshold: u32, probe_count: u32, reset_timeout_ms: u64) -> BreakerRegistry {
        BreakerRegistry::new(BreakerConfig {
            failure_threshold,
            probe_count,
            reset_timeout_ms,
            ..BreakerConfig::default()
        })
    }

    fn unavailable() -> ControlError {
        ControlError::Unavailable("down".into())
    }

    #[test]
    fn test_starts_closed() {
        let reg = registry(3, 2, 1000);
        assert_eq!(reg.admit("oracle/keygen"), Admission::Attempt);
        assert_eq!(reg.state("oracle/keygen"), "closed");
    }

    #[test]
    fn test_streak_of_counted_failures_trips() {
        let reg = registry(3, 2, 60_000);
        for _ in 0..3 {
            assert_eq!(reg.admit("r"), Admission::Attempt);
            reg.observe("r", Some(&unavailable()));
        }
        assert_eq!(reg.admit("r"), Admission::ShortCircuit);
        assert_eq!(reg.state("r"), "open");
    }

    #[test]
    fn test_success_clears_the_streak() {
        let reg = registry(3, 2, 60_000);
        reg.observe("r", Some(&unavailable()));
        reg.observe("r", Some(&unavailable()));
        reg.observe("r", None);
        reg.observe("r", Some(&unavailable()));
        reg.observe("r", Some(&unavailable()));
        assert_eq!(reg.admit("r"), Admission::Attempt);
    }

    #[test]
    fn test_client_errors_do_not_count() {
        let reg = registry(2, 1, 60_000);
        reg.observe("r", Some(&ControlError::InvalidArgument("bad".into())));
        reg.observe("r", Some(&ControlError::InvalidArgument("bad".into())));
        reg.observe("r", Some(&ControlError::InvalidArgument("bad".into())));
        assert_eq!(reg.admit("r"), Admission::Attempt);
    }

    #[test]
    fn test_own_rejections_are_discarded() {
        let reg = registry(1, 1, 60_000);
        reg.observe("r", Some(&unavailable()));
        assert_eq!(reg.admit("r"), Admission::ShortCircuit);
        // Feeding the short-circuit back must not restart the cooldown or
        // count anywhere.
        reg.observe(
            "r",
            Some(&ControlError::CircuitOpen {
                resource: "r".into(),
            }),
        );
        assert_eq!(reg.state("r"), "open");
    }

    #[test]
    fn test_cooldown_hands_out_bounded_probes() {
        let reg = registry(1, 2, 0);
        reg.observe("r", Some(&unavailable()));
        std::thread::sleep(Duration::from_millis(10));

        // probe_count = 2: two probe slots, then traffic holds.
        assert_eq!(reg.admit("r"), Admission::Probe);
        assert_eq!(reg.admit("r"), Admission::Probe);
        assert_eq!(reg.admit("r"), Admission::ShortCircuit);
        assert_eq!(reg.state("r"), "half_open");
    }

    #[test]
    fn test_full_probe_set_closes() {
        let reg = registry(1, 2, 0);
        reg.observe("r", Some(&unavailable()));
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(reg.admit("r"), Admission::Probe);
        reg.observe("r", None);
        assert_eq!(reg.state("r"), "half_open");
        assert_eq!(reg.admit("r"), Admission::Probe);
        reg.observe("r", None);
        assert_eq!(reg.state("r"), "closed");
        assert_eq!(reg.admit("r"), Admission::Attempt);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let reg = registry(1, 2, 0);
        reg.observe("r", Some(&unavailable()));
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(reg.admit("r"), Admission::Probe);
        reg.observe("r", Some(&unavailable()));
        assert_eq!(reg.state("r"), "open");

        // And the cycle repeats after another cooldown.
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(reg.admit("r"), Admission::Probe);
        reg.observe("r", None);
        reg.observe("r", None);
        assert_eq!(reg.state("r"), "closed");
    }

    #[test]
    fn test_resources_are_independent() {
        let reg = registry(1, 1, 60_000);
        reg.observe("a", Some(&unavailable()));
        assert_eq!(reg.admit("a"), Admission::ShortCircuit);
        assert_eq!(reg.admit("b"), Admission::Attempt);
    }
}
