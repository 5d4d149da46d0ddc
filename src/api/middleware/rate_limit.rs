//! Global admission rate limiting
//!
//! A keyed token bucket caps the request rate per identity (key prefix, or
//! source IP for unauthenticated callers). Rejections happen before quota
//! admission and touch no persistence.

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

type KeyedLimiter =
    RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock, NoOpMiddleware>;

/// Process-wide admission limiter: `max` requests per `window_ms` per
/// identity, with the full window available as burst.
pub struct AdmissionLimiter {
    limiter: KeyedLimiter,
}

impl AdmissionLimiter {
    pub fn new(max: u32, window_ms: u64) -> Self {
        let max = NonZeroU32::new(max.max(1)).unwrap_or(NonZeroU32::MIN);
        let period = Duration::from_millis((window_ms / u64::from(max.get())).max(1));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_minute(max))
            .allow_burst(max);
        AdmissionLimiter {
            limiter: RateLimiter::keyed(quota),
        }
    }

    /// True when the identity still has budget in the current window.
    pub fn check(&self, identity: &str) -> bool {
        self.limiter.check_key(&identity.to_string()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_per_identity() {
        let limiter = AdmissionLimiter::new(3, 60_000);

        for _ in 0..3 {
            assert!(limiter.check("gwk_abcdefgh"));
        }
        assert!(!limiter.check("gwk_abcdefgh"));

        // A different identity has its own bucket.
        assert!(limiter.check("10.1.2.3"));
    }
}
