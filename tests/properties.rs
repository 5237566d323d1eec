//! Property tests for the admission-bound, disjointness and breaker
//! invariants.

use aether_control::config::{BreakerConfig, MarketConfig, RateLimitSection, RateRuleConfig};
use aether_control::error::ControlError;
use aether_control::market::SpectrumPool;
use aether_control::ratelimit::RateLimiter;
use aether_control::resilience::{Admission, BreakerRegistry};
use proptest::prelude::*;
use std::collections::HashMap;

proptest! {
    /// Over a burst issued back-to-back, admissions never exceed the bucket
    /// capacity plus the one-tick refill slack.
    #[test]
    fn ratelimit_admission_bounded(capacity in 1u64..50, burst in 1usize..200) {
        tokio_test::block_on(async move {
            let mut rules = HashMap::new();
            rules.insert(
                "k".to_string(),
                RateRuleConfig {
                    algorithm: "token_bucket".into(),
                    capacity,
                    refill_rate: 1.0,
                    window_ms: 1000,
                    distributed: false,
                },
            );
            let limiter = RateLimiter::new(RateLimitSection {
                default: RateRuleConfig::default(),
                rules,
            });

            let mut admitted = 0u64;
            for _ in 0..burst {
                if limiter.check("k", 1).await.is_admitted() {
                    admitted += 1;
                }
            }
            prop_assert!(
                admitted <= capacity + 1,
                "admitted {} exceeds capacity {} + tick",
                admitted,
                capacity
            );
            Ok(())
        })?;
    }

    /// Committed assignments in a band never overlap and never exceed the
    /// band's capacity.
    #[test]
    fn spectrum_assignments_disjoint(requests in prop::collection::vec(1u64..400, 1..20)) {
        let pool = SpectrumPool::new(&MarketConfig::default().bands);
        let mut committed = Vec::new();
        let mut total = 0u64;

        for (i, mbps) in requests.iter().enumerate() {
            if let Some((range, _power)) = pool.commit("mid", &format!("a{}", i), *mbps) {
                committed.push(range);
                total += mbps;
            }
        }

        prop_assert!(total <= 1000, "committed {} mbps into a 1000 mbps band", total);
        for (i, a) in committed.iter().enumerate() {
            for b in committed.iter().skip(i + 1) {
                prop_assert!(!a.overlaps(b), "ranges {:?} and {:?} overlap", a, b);
            }
        }
    }

    /// After `threshold` consecutive counted failures the breaker rejects
    /// the very next call.
    #[test]
    fn breaker_opens_exactly_at_threshold(threshold in 1u32..10) {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms: 60_000,
            ..BreakerConfig::default()
        });

        for i in 0..threshold {
            prop_assert!(
                matches!(registry.admit("r"), Admission::Attempt),
                "call {} of {} should still be admitted",
                i,
                threshold
            );
            registry.observe("r", Some(&ControlError::Unavailable("down".into())));
        }
        prop_assert!(matches!(registry.admit("r"), Admission::ShortCircuit));
    }

    /// A sliding-window rule admits at most `capacity` within one window.
    #[test]
    fn sliding_window_bounded(capacity in 1u64..30) {
        tokio_test::block_on(async move {
            let mut rules = HashMap::new();
            rules.insert(
                "w".to_string(),
                RateRuleConfig {
                    algorithm: "leaky_bucket".into(),
                    capacity,
                    refill_rate: 0.0,
                    window_ms: 60_000,
                    distributed: false,
                },
            );
            let limiter = RateLimiter::new(RateLimitSection {
                default: RateRuleConfig::default(),
                rules,
            });

            let mut admitted = 0u64;
            for _ in 0..(capacity * 3) {
                if limiter.check("w", 1).await.is_admitted() {
                    admitted += 1;
                }
            }
            prop_assert_eq!(admitted, capacity);
            Ok(())
        })?;
    }
}
