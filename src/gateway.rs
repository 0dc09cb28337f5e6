//! Request routing and the lookup pipeline.
//!
//! Every inbound request is assigned a monotonically increasing request ID
//! and wrapped in a [`tracing::Span`] carrying structured fields for
//! observability.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use tracing::{Instrument, info, warn};

use crate::access::AccessGate;
use crate::cache::LookupCache;
use crate::headers::ClientIdentity;
use crate::lookup::LookupOrchestrator;
use crate::metrics::Metrics;
use crate::rate_limit::IpRateLimiter;
use crate::store::KeyValueStore;
use crate::upstream::UpstreamClient;
use crate::{GatewayError, Result, RuntimeConfig, admin, headers};

/// Path prefix of the lookup endpoint; the subject key follows it.
pub const LOOKUP_PREFIX: &str = "/api/v1/cpf/";

/// Path prefix of the administrative endpoints.
pub const ADMIN_PREFIX: &str = "/admin";

pub const HEALTH_PATH: &str = "/health";

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// The assembled gateway: admission, rate limiting and lookups over one
/// shared configuration.
#[derive(Debug)]
pub struct Gateway<S> {
    config: Arc<RuntimeConfig>,
    access: AccessGate,
    limiter: IpRateLimiter,
    lookup: LookupOrchestrator<S>,
    metrics: Arc<Metrics>,
}

impl<S: KeyValueStore> Gateway<S> {
    /// Wires every component from `config`, caching lookups in `store`.
    pub fn new(config: Arc<RuntimeConfig>, store: S) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let access = AccessGate::new(
            config.allowed_origins.clone(),
            config.allowed_ips.clone(),
            config.require_origin,
            Arc::clone(&metrics),
        );
        let limiter = IpRateLimiter::from_config(&config.rate_limit)?;
        let cache = LookupCache::new(store, config.store_timeout, Arc::clone(&metrics));
        let lookup = LookupOrchestrator::new(
            cache,
            UpstreamClient::from_config(&config),
            Arc::clone(&metrics),
            config.cache_ttl,
            config.cache_write_policy,
        );

        Ok(Self {
            config,
            access,
            limiter,
            lookup,
            metrics,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn access(&self) -> &AccessGate {
        &self.access
    }

    pub fn limiter(&self) -> &IpRateLimiter {
        &self.limiter
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn cache(&self) -> &LookupCache<S> {
        self.lookup.cache()
    }

    /// Routes a single inbound request.
    ///
    /// Lookups under [`LOOKUP_PREFIX`] run through admission, then the
    /// per-IP rate limit, then the lookup pipeline; the first refusal ends
    /// the request. Admin routes under [`ADMIN_PREFIX`] only require the
    /// admin token. [`HEALTH_PATH`] pings the store.
    pub async fn handle_request<B>(
        &self,
        req: Request<B>,
        client_addr: SocketAddr,
    ) -> Result<Response<Full<Bytes>>>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let method = req.method().clone();
        let path = req.uri().path().to_owned();

        let span = tracing::info_span!(
            "request",
            id = request_id,
            method = %method,
            path = %path,
            client = %client_addr,
        );

        async move {
            let start = std::time::Instant::now();

            let result = if let Some(key) = path.strip_prefix(LOOKUP_PREFIX) {
                if method == Method::GET {
                    self.serve_lookup(req.headers(), key, client_addr).await
                } else {
                    Err(GatewayError::NotFound(path.clone()))
                }
            } else if path == ADMIN_PREFIX || path.starts_with("/admin/") {
                admin::handle(self, req).await
            } else if path == HEALTH_PATH && method == Method::GET {
                self.health().await
            } else {
                Err(GatewayError::NotFound(path.clone()))
            };

            let latency_ms = start.elapsed().as_millis() as u64;
            match &result {
                Ok(resp) => info!(
                    status = resp.status().as_u16(),
                    latency_ms, "request completed"
                ),
                Err(e) => info!(
                    status = e.status_code().as_u16(),
                    latency_ms,
                    error = %e,
                    "request refused"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn serve_lookup(
        &self,
        headers: &HeaderMap,
        raw_key: &str,
        client_addr: SocketAddr,
    ) -> Result<Response<Full<Bytes>>> {
        let identity =
            ClientIdentity::resolve(headers, client_addr, self.config.trusted_proxy_hops);
        let ip = identity.ip;

        self.access.validate(ip, identity.origin)?;

        self.limiter.acquire(&ip).map_err(|retry_after_ms| {
            self.metrics.record_rate_limit_block();
            warn!(%ip, retry_after_ms, "rate limit exceeded");
            GatewayError::RateLimited { retry_after_ms }
        })?;

        self.metrics.record_request();

        let key = decode_path_segment(raw_key)?;
        if !self.config.is_valid_subject(&key) {
            return Err(GatewayError::InvalidSubject(format!(
                "malformed subject key \"{key}\""
            )));
        }

        let outcome = self.lookup.handle(&key).await?;
        let mut resp = json_response(StatusCode::OK, &outcome.record)?;
        resp.headers_mut().insert(
            headers::CACHE_STATUS_HEADER,
            HeaderValue::from_static(outcome.source.as_str()),
        );
        Ok(resp)
    }

    async fn health(&self) -> Result<Response<Full<Bytes>>> {
        self.lookup.cache().ping().await?;
        json_response(StatusCode::OK, &serde_json::json!({ "status": "ok" }))
    }
}

/// Serializes `value` into a JSON response with the given status.
pub(crate) fn json_response<T: Serialize + ?Sized>(
    status: StatusCode,
    value: &T,
) -> Result<Response<Full<Bytes>>> {
    let body = serde_json::to_vec(value)
        .map_err(|e| GatewayError::Internal(format!("failed to encode response: {e}")))?;

    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))?)
}

/// Percent-decodes one path segment.
pub(crate) fn decode_path_segment(segment: &str) -> Result<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| GatewayError::BadRequest(format!("path segment is not UTF-8: {segment}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_percent_encoded_segments() {
        assert_eq!(
            decode_path_segment("https%3A%2F%2Fapp.example").unwrap(),
            "https://app.example"
        );
        assert_eq!(decode_path_segment("123").unwrap(), "123");
        assert!(matches!(
            decode_path_segment("%FF"),
            Err(GatewayError::BadRequest(_))
        ));
    }

    #[test]
    fn json_response_sets_content_type() {
        let resp = json_response(StatusCode::CREATED, &serde_json::json!({"a": 1})).unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
    }
}
