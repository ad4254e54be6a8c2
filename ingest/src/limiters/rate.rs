use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use metrics::counter;

use crate::limiters::AdmissionError;

type DirectLimiter<C> =
    governor::RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Single process-wide budget for one route, shared by every caller.
///
/// Backed by governor's GCRA, which refills continuously at `per_minute / 60`
/// cells per second and allows a burst of `per_minute`. State updates are
/// lock-free compare-and-swap, so concurrent checks never lose a refill.
pub struct RateLimiter<C: Clock = DefaultClock> {
    // None when the quota is zero or negative
    limiter: Option<DirectLimiter<C>>,
    clock: C,
}

impl RateLimiter {
    pub fn new(per_minute: i64) -> Self {
        Self::with_clock(per_minute, DefaultClock::default())
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(per_minute: i64, clock: C) -> Self {
        let limiter = u32::try_from(per_minute)
            .ok()
            .and_then(NonZeroU32::new)
            .map(|n| governor::RateLimiter::direct_with_clock(Quota::per_minute(n), &clock));

        Self { limiter, clock }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Consumes one cell, or returns how long until the next one is available.
    pub fn check(&self) -> Result<(), AdmissionError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };

        limiter.check().map_err(|not_until| {
            let retry_after = not_until.wait_time_from(self.clock.now());
            let rejected = AdmissionError::RateLimited { retry_after };
            counter!("ingest_admission_rejected_total", "guard" => rejected.guard()).increment(1);
            rejected
        })
    }
}

/// Whole seconds for a `Retry-After` header, rounded up and never zero.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use governor::clock::FakeRelativeClock;

    #[test]
    fn allows_quota_then_refills_one_cell() {
        let clock = FakeRelativeClock::default();
        let limiter = RateLimiter::with_clock(20, clock.clone());

        for _ in 0..20 {
            assert_eq!(limiter.check(), Ok(()));
        }
        let Err(AdmissionError::RateLimited { retry_after }) = limiter.check() else {
            panic!("21st call should be limited");
        };
        assert_eq!(retry_after, Duration::from_secs(3));

        // 20 per minute refills one cell every 3 seconds
        clock.advance(Duration::from_secs(1));
        assert!(limiter.check().is_err());
        clock.advance(Duration::from_secs(2));
        assert_eq!(limiter.check(), Ok(()));
        assert!(limiter.check().is_err());
    }

    #[test]
    fn refill_is_capped_at_quota() {
        let clock = FakeRelativeClock::default();
        let limiter = RateLimiter::with_clock(5, clock.clone());

        clock.advance(Duration::from_secs(3600));
        for _ in 0..5 {
            assert_eq!(limiter.check(), Ok(()));
        }
        assert!(limiter.check().is_err());
    }

    #[test]
    fn non_positive_quota_disables_the_guard() {
        for quota in [0, -5] {
            let limiter = RateLimiter::with_clock(quota, FakeRelativeClock::default());
            assert!(!limiter.is_enabled());
            for _ in 0..1000 {
                assert_eq!(limiter.check(), Ok(()));
            }
        }
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(200)), 1);
        assert_eq!(retry_after_secs(Duration::from_secs(3)), 3);
        assert_eq!(retry_after_secs(Duration::from_millis(3001)), 4);
    }
}
