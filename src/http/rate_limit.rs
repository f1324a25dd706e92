//! IP-based rate limiting for mutating HTTP endpoints.
//!
//! One keyed limiter holds the state for every client IP. A rejected check
//! reports how long the caller must wait, so the HTTP layer can answer 429
//! with a Retry-After header instead of a bare refusal.

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::Duration;

/// A request was over its IP's budget; retry after the given wait.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitExceeded {
    pub retry_after: Duration,
}

/// Per-IP write-rate limiter.
pub struct IpRateLimiter {
    limiter: RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>,
    clock: DefaultClock,
}

impl IpRateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let quota = NonZeroU32::new(requests_per_minute)
            .unwrap_or_else(|| NonZeroU32::new(60).unwrap());
        Self {
            limiter: RateLimiter::keyed(Quota::per_minute(quota)),
            clock: DefaultClock::default(),
        }
    }

    /// Check whether a request from `ip` is within budget. On rejection the
    /// error carries the wait until the next permitted request.
    pub fn check(&self, ip: IpAddr) -> Result<(), RateLimitExceeded> {
        self.limiter.check_key(&ip).map_err(|not_until| {
            RateLimitExceeded {
                retry_after: not_until.wait_time_from(self.clock.now()),
            }
        })
    }

    /// Drop state for IPs whose budgets have fully replenished.
    pub fn cleanup_stale(&self) {
        self.limiter.retain_recent();
    }

    pub fn tracked_ips(&self) -> usize {
        self.limiter.len()
    }
}
