//! # idgate
//!
//! An HTTP gateway in front of an identity-lookup service, built on
//! [Hyper].
//!
//! A lookup request passes, in order:
//!
//! 1. **Admission** ([`AccessGate`]): an optional client-IP allow-list,
//!    then an `Origin` allow-list. Unknown origins are refused and queued
//!    as pending until an administrator approves them.
//! 2. **Rate limiting** ([`IpRateLimiter`]): a token bucket per client IP.
//! 3. **Lookup** ([`LookupOrchestrator`]): cache-aside over a key-value
//!    store ([`LookupCache`]), falling back to one bounded upstream call
//!    whose validated result is cached with a fixed TTL.
//!
//! Corrupt cache entries are deleted on read and reported as misses.
//! Counters for every stage live in [`Metrics`] and are exposed, together
//! with the pending-domain workflow, on the token-protected `/admin` routes.
//!
//! [Hyper]: https://hyper.rs/

pub mod access;
pub mod admin;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod headers;
pub mod lookup;
pub mod metrics;
pub mod rate_limit;
pub mod server;
pub mod store;
pub mod tls;
pub mod upstream;

pub use access::{AccessGate, AdmissionSnapshot, DenyReason, DomainError, PendingDomain};
pub use cache::{CacheError, CacheLookup, CacheRecord, LookupCache};
pub use config::{CacheWritePolicy, Config, RuntimeConfig, StoreBackend};
pub use error::GatewayError;
pub use gateway::Gateway;
pub use lookup::{LookupOrchestrator, LookupOutcome, Source};
pub use metrics::{Metrics, MetricsSnapshot};
pub use rate_limit::IpRateLimiter;
pub use store::{KeyValueStore, MemoryStore, RedisStore, StoreError};
pub use upstream::UpstreamClient;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, GatewayError>;
