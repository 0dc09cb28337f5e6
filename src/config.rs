//! Configuration loading, validation, and pre-compiled runtime state.
//!
//! The gateway reads its YAML configuration exactly once at startup. The
//! raw [`Config`] mirrors the on-disk schema; [`Config::into_runtime`]
//! validates it and produces a [`RuntimeConfig`] holding parsed addresses,
//! the parsed upstream URL and the compiled subject-key pattern, so nothing
//! on the request path touches the filesystem or compiles a regex.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{GatewayError, Result};

/// Default socket address the gateway binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Default per-IP burst capacity.
pub const DEFAULT_RATE_LIMIT_BURST: u32 = 10;

/// Default per-IP refill rate in tokens per second.
pub const DEFAULT_REFILL_PER_SECOND: u32 = 1;

/// Default timeout for the upstream lookup call.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a single key-value store operation.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifetime of a cached lookup record.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default pattern a subject key must match before any lookup work.
pub const DEFAULT_SUBJECT_PATTERN: &str = "^[0-9A-Za-z._-]{1,64}$";

/// Default maximum number of concurrent in-flight requests.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 1000;

/// Default number of trusted proxies in front of the gateway.
pub const DEFAULT_TRUSTED_PROXY_HOPS: usize = 1;

/// Default Redis port.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Raw configuration as deserialized from the YAML file.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Socket address the gateway listens on (default `"127.0.0.1:8080"`).
    #[serde(default)]
    pub listen: Option<String>,
    /// Secret expected in the `X-Admin-Token` header of admin requests.
    #[serde(default)]
    pub admin_token: String,
    /// Origins admitted without approval. Empty, or containing `"*"`,
    /// admits every origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Client IPs admitted. Empty admits every IP.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Refuse requests without an `Origin` header (default: `true`).
    #[serde(default)]
    pub require_origin: Option<bool>,
    /// Take the client IP from `X-Forwarded-For` instead of the TCP peer
    /// address. Only enable behind a trusted proxy.
    #[serde(default)]
    pub trust_forwarded_for: bool,
    /// Number of trusted proxies appending to `X-Forwarded-For`; the client
    /// IP is the entry this many places from the right (default: 1).
    #[serde(default)]
    pub trusted_proxy_hops: Option<usize>,
    /// Per-IP token bucket settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Upstream identity-lookup service.
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Key-value store backing the lookup cache.
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Regex a subject key must match (default `^[0-9A-Za-z._-]{1,64}$`).
    #[serde(default)]
    pub subject_pattern: Option<String>,
    /// Maximum concurrent in-flight requests before returning 503
    /// Service Unavailable (default: 1000).
    #[serde(default)]
    pub max_concurrent_requests: Option<usize>,
}

/// Per-IP token bucket configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Bucket capacity, i.e. how many requests a fresh client may burst.
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Tokens added back per second.
    #[serde(default = "default_refill_per_second")]
    pub refill_per_second: u32,
}

fn default_burst() -> u32 {
    DEFAULT_RATE_LIMIT_BURST
}

fn default_refill_per_second() -> u32 {
    DEFAULT_REFILL_PER_SECOND
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: default_burst(),
            refill_per_second: default_refill_per_second(),
        }
    }
}

/// Upstream lookup service settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Lookup endpoint; the subject key and token are appended as the
    /// `cpf` and `token` query parameters.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub token: String,
    /// Timeout in milliseconds for the whole upstream call (default: 10000).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Which key-value store backs the cache.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// In-process map; entries are lost on restart.
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub redis: RedisConfig,
    /// Timeout in milliseconds for a single store operation (default: 2000).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Redis connection parameters.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
}

fn default_redis_host() -> String {
    "127.0.0.1".into()
}

fn default_redis_port() -> u16 {
    DEFAULT_REDIS_PORT
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            username: None,
            password: None,
            db: 0,
        }
    }
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("db", &self.db)
            .finish()
    }
}

/// What to do when a validated upstream record cannot be written to the
/// cache.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheWritePolicy {
    /// Fail the request; a record is only returned once it is cached.
    #[default]
    FailClosed,
    /// Log the failure and return the record uncached.
    FailOpen,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Record lifetime in seconds (default: 86400).
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub write_policy: CacheWritePolicy,
}

/// A string that never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Fully validated, ready-to-use configuration.
///
/// Created once at startup and shared across all request handlers via `Arc`.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub listen: SocketAddr,
    pub admin_token: Secret,
    pub allowed_origins: Vec<String>,
    pub allowed_ips: Vec<IpAddr>,
    pub require_origin: bool,
    /// `X-Forwarded-For` entries to count back from the right when
    /// resolving the client IP. Zero means the TCP peer address is used.
    pub trusted_proxy_hops: usize,
    pub rate_limit: RateLimitConfig,
    pub upstream_endpoint: Url,
    pub upstream_token: Secret,
    /// Bound on the whole upstream call, including reading the body.
    pub upstream_timeout: Duration,
    pub store_backend: StoreBackend,
    pub redis: RedisConfig,
    /// Bound on each individual store operation.
    pub store_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_write_policy: CacheWritePolicy,
    pub subject_pattern: Regex,
    pub max_concurrent_requests: usize,
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    ///
    /// Returns a [`GatewayError::Config`] if the file cannot be opened or
    /// its contents fail YAML deserialization.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            GatewayError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| GatewayError::Config(format!("failed to parse config: {e}")))
    }

    /// Validates all fields and produces a [`RuntimeConfig`].
    ///
    /// An admin token and an upstream endpoint are mandatory.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        if self.admin_token.trim().is_empty() {
            return Err(GatewayError::Config("admin_token must be set".into()));
        }

        let listen_str = self.listen.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR);
        let listen = listen_str.parse::<SocketAddr>().map_err(|e| {
            GatewayError::Config(format!("invalid listen address \"{listen_str}\": {e}"))
        })?;

        let allowed_ips = self
            .allowed_ips
            .iter()
            .map(|ip| {
                ip.trim().parse::<IpAddr>().map_err(|e| {
                    GatewayError::Config(format!("invalid allowed IP \"{ip}\": {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if self.rate_limit.burst == 0 || self.rate_limit.refill_per_second == 0 {
            return Err(GatewayError::Config(
                "rate_limit burst and refill_per_second must be positive".into(),
            ));
        }

        let trusted_proxy_hops = match (self.trust_forwarded_for, self.trusted_proxy_hops) {
            (false, _) => 0,
            (true, Some(0)) => {
                return Err(GatewayError::Config(
                    "trusted_proxy_hops must be positive when trust_forwarded_for is set".into(),
                ));
            }
            (true, hops) => hops.unwrap_or(DEFAULT_TRUSTED_PROXY_HOPS),
        };

        let upstream_endpoint = validate_endpoint(&self.upstream.endpoint)?;

        let pattern = self
            .subject_pattern
            .as_deref()
            .unwrap_or(DEFAULT_SUBJECT_PATTERN);
        let subject_pattern = Regex::new(pattern).map_err(|e| {
            GatewayError::Config(format!("invalid subject_pattern \"{pattern}\": {e}"))
        })?;

        let upstream_timeout = self
            .upstream
            .timeout_ms
            .map_or(DEFAULT_UPSTREAM_TIMEOUT, Duration::from_millis);

        let store_timeout = self
            .store
            .timeout_ms
            .map_or(DEFAULT_STORE_TIMEOUT, Duration::from_millis);

        let cache_ttl = self
            .cache
            .ttl_secs
            .map_or(DEFAULT_CACHE_TTL, Duration::from_secs);
        if cache_ttl.is_zero() {
            return Err(GatewayError::Config("cache ttl_secs must be positive".into()));
        }

        let max_concurrent_requests = self
            .max_concurrent_requests
            .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS);
        if max_concurrent_requests == 0 {
            return Err(GatewayError::Config(
                "max_concurrent_requests must be positive".into(),
            ));
        }

        Ok(RuntimeConfig {
            listen,
            admin_token: Secret::new(self.admin_token),
            allowed_origins: self.allowed_origins,
            allowed_ips,
            require_origin: self.require_origin.unwrap_or(true),
            trusted_proxy_hops,
            rate_limit: self.rate_limit,
            upstream_endpoint,
            upstream_token: Secret::new(self.upstream.token),
            upstream_timeout,
            store_backend: self.store.backend,
            redis: self.store.redis,
            store_timeout,
            cache_ttl,
            cache_write_policy: self.cache.write_policy,
            subject_pattern,
            max_concurrent_requests,
        })
    }
}

/// Parses the upstream endpoint, requiring an `http` or `https` URL with a host.
fn validate_endpoint(endpoint: &str) -> Result<Url> {
    if endpoint.is_empty() {
        return Err(GatewayError::Config(
            "upstream endpoint must not be empty".into(),
        ));
    }

    let url = Url::parse(endpoint)
        .map_err(|e| GatewayError::Config(format!("invalid upstream endpoint: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(GatewayError::Config(format!(
            "upstream endpoint must be an http(s) URL with a host: {endpoint}"
        )));
    }

    Ok(url)
}

impl RuntimeConfig {
    /// Returns `true` if `key` is acceptable as a subject key.
    pub fn is_valid_subject(&self, key: &str) -> bool {
        self.subject_pattern.is_match(key)
    }
}
