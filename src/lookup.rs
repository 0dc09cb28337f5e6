//! Per-request lookup pipeline.
//!
//! A lookup runs through these stages, stopping at the first failure:
//!
//! 1. **Cache check**: a valid cached record is returned directly and the
//!    upstream is never contacted. A store failure ends the request with an
//!    internal error.
//! 2. **Upstream fetch**: one bounded GET against the lookup service, no
//!    retry. Non-2xx answers keep their status.
//! 3. **Validate**: the payload must decode and carry a subject id and
//!    name; otherwise nothing is cached.
//! 4. **Store**: the validated record is written with the configured TTL.
//! 5. **Respond**: the record is handed back to the caller.
//!
//! What happens when step 4 fails is the [`CacheWritePolicy`]: by default a
//! record is never returned unless it was cached first.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::cache::{CacheLookup, CacheRecord, LookupCache};
use crate::config::CacheWritePolicy;
use crate::metrics::Metrics;
use crate::store::KeyValueStore;
use crate::upstream::{self, UpstreamClient};
use crate::{GatewayError, Result};

/// Where a returned record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Upstream,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "HIT",
            Self::Upstream => "MISS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupOutcome {
    pub record: CacheRecord,
    pub source: Source,
}

/// Drives a lookup from cache check to response.
#[derive(Debug)]
pub struct LookupOrchestrator<S> {
    cache: LookupCache<S>,
    upstream: UpstreamClient,
    metrics: Arc<Metrics>,
    ttl: Duration,
    write_policy: CacheWritePolicy,
}

impl<S: KeyValueStore> LookupOrchestrator<S> {
    pub fn new(
        cache: LookupCache<S>,
        upstream: UpstreamClient,
        metrics: Arc<Metrics>,
        ttl: Duration,
        write_policy: CacheWritePolicy,
    ) -> Self {
        Self {
            cache,
            upstream,
            metrics,
            ttl,
            write_policy,
        }
    }

    pub fn cache(&self) -> &LookupCache<S> {
        &self.cache
    }

    /// Resolves `key` to a record.
    pub async fn handle(&self, key: &str) -> Result<LookupOutcome> {
        match self.cache.get(key).await {
            Ok(CacheLookup::Hit(record)) => {
                self.metrics.record_cache_hit();
                debug!(key, "served from cache");
                return Ok(LookupOutcome {
                    record,
                    source: Source::Cache,
                });
            }
            Ok(CacheLookup::Miss) => self.metrics.record_cache_miss(),
            Err(e) => {
                error!(key, error = %e, "cache read failed");
                return Err(GatewayError::Internal(format!("cache read failed: {e}")));
            }
        }

        let body = self.upstream.fetch(key).await.map_err(|e| {
            self.metrics.record_upstream_error();
            GatewayError::UpstreamUnavailable {
                status: e.status,
                message: e.message,
            }
        })?;

        let record = upstream::decode_record(&body, Utc::now()).map_err(|reason| {
            warn!(key, %reason, "rejecting upstream payload");
            GatewayError::InvalidSubject(reason)
        })?;

        if let Err(e) = self.cache.put(key, &record, self.ttl).await {
            match self.write_policy {
                CacheWritePolicy::FailClosed => {
                    error!(key, error = %e, "failed to cache record, discarding it");
                    return Err(GatewayError::Internal(format!("failed to cache record: {e}")));
                }
                CacheWritePolicy::FailOpen => {
                    warn!(key, error = %e, "failed to cache record, serving it uncached");
                }
            }
        }

        Ok(LookupOutcome {
            record,
            source: Source::Upstream,
        })
    }
}
