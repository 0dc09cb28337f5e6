//! Per-client token buckets keyed by IP address.
//!
//! Wraps the [`governor`] crate's keyed rate limiter. Each IP gets a bucket
//! holding up to `burst` tokens that refills at `refill_per_second` tokens
//! per second. The keyed state store creates a bucket on the first request
//! from an IP and consumes its first token in the same atomic step, so
//! concurrent first requests never produce two buckets for one IP.
//!
//! Buckets are not removed on their own. [`IpRateLimiter::retain_recent`]
//! drops every bucket that has refilled to capacity (an idle client is
//! indistinguishable from a new one) and is driven by a background task.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};

use crate::config::RateLimitConfig;
use crate::{GatewayError, Result};

type InnerLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock, NoOpMiddleware>;

/// A thread-safe registry of per-IP token buckets.
///
/// Cheap to clone; clones share the same buckets.
#[derive(Debug, Clone)]
pub struct IpRateLimiter {
    inner: Arc<InnerLimiter>,
}

impl IpRateLimiter {
    /// Creates a registry from the given configuration.
    ///
    /// Fails with [`GatewayError::Config`] if `burst` or `refill_per_second`
    /// is zero.
    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        let refill = NonZeroU32::new(config.refill_per_second)
            .ok_or_else(|| GatewayError::Config("refill_per_second must be non-zero".into()))?;
        let burst = NonZeroU32::new(config.burst)
            .ok_or_else(|| GatewayError::Config("burst must be non-zero".into()))?;

        let quota = Quota::per_second(refill).allow_burst(burst);

        Ok(Self {
            inner: Arc::new(RateLimiter::dashmap(quota)),
        })
    }

    /// Takes one token from the bucket for `ip`, creating the bucket if this
    /// is the first request from that address.
    ///
    /// Returns `Err(retry_after_ms)` with the estimated wait until the next
    /// token when the bucket is empty. A refused call consumes nothing.
    pub fn acquire(&self, ip: &IpAddr) -> std::result::Result<(), u64> {
        self.inner.check_key(ip).map_err(|not_until| {
            not_until
                .wait_time_from(governor::clock::Clock::now(&DefaultClock::default()))
                .as_millis() as u64
        })
    }

    /// Drops buckets that have fully refilled since their last use.
    pub fn retain_recent(&self) {
        self.inner.retain_recent();
    }

    /// Returns the number of IP addresses currently holding a bucket.
    pub fn tracked_ip_count(&self) -> usize {
        self.inner.len()
    }
}

/// Interval between idle-bucket sweeps.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
