//! Administrative endpoints.
//!
//! Every route requires the `X-Admin-Token` header to match the configured
//! secret before anything else happens. Admin traffic bypasses admission and
//! rate limiting and is not counted in the request metrics.
//!
//! | Method | Path | Effect |
//! |---|---|---|
//! | GET | `/admin/metrics` | counters plus pending-domain request counts |
//! | GET | `/admin/domains` | allowed origins, allowed IPs, pending domains |
//! | POST | `/admin/domains` | add `{"domain": ...}` to the allowed origins |
//! | DELETE | `/admin/domains/{domain}` | remove an allowed origin |
//! | POST | `/admin/domains/approve/{domain}` | approve a pending domain |
//! | POST | `/admin/cache/clear?cpf={key}` | drop one cached record |

use std::collections::BTreeMap;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Secret;
use crate::gateway::{ADMIN_PREFIX, Gateway, decode_path_segment, json_response};
use crate::metrics::MetricsSnapshot;
use crate::store::KeyValueStore;
use crate::{GatewayError, Result, headers};

/// Largest admin request body accepted, in bytes.
pub const MAX_BODY_BYTES: u64 = 16 * 1024;

#[derive(Debug, Deserialize)]
struct AddDomainRequest {
    domain: String,
}

#[derive(Debug, Serialize)]
struct AdminMetrics {
    #[serde(flatten)]
    counters: MetricsSnapshot,
    /// Request count per pending domain.
    pending_domains: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize)]
struct Message {
    message: &'static str,
}

/// Constant-time byte comparison. Runs over the longer input so the time
/// taken does not reveal where, or whether by length, the inputs differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len_eq = a.len() == b.len();
    let max_len = a.len().max(b.len());
    let mut diff = 0u8;

    for i in 0..max_len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }

    len_eq && diff == 0
}

fn authorize(headers: &HeaderMap, expected: &Secret) -> Result<()> {
    match headers::admin_token(headers) {
        Some(token) if constant_time_eq(token, expected.expose().as_bytes()) => Ok(()),
        presented => {
            warn!(token_present = presented.is_some(), "rejected admin request");
            Err(GatewayError::Unauthorized)
        }
    }
}

/// Dispatches a request whose path starts with `/admin`.
pub(crate) async fn handle<S, B>(gateway: &Gateway<S>, req: Request<B>) -> Result<Response<Full<Bytes>>>
where
    S: KeyValueStore,
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    authorize(req.headers(), &gateway.config().admin_token)?;

    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let segments = route_segments(&path);

    match (&method, segments.as_slice()) {
        (&Method::GET, ["metrics"]) => metrics(gateway),
        (&Method::GET, ["domains"]) => json_response(StatusCode::OK, &gateway.access().snapshot()),
        (&Method::POST, ["domains"]) => {
            let body: AddDomainRequest = read_json(req).await?;
            let domain = body.domain.trim();
            if domain.is_empty() {
                return Err(GatewayError::BadRequest("domain must not be empty".into()));
            }
            gateway.access().add_domain(domain)?;
            json_response(
                StatusCode::OK,
                &Message {
                    message: "domain added",
                },
            )
        }
        (&Method::DELETE, ["domains", domain]) => {
            gateway.access().remove_domain(&decode_path_segment(domain)?)?;
            json_response(
                StatusCode::OK,
                &Message {
                    message: "domain removed",
                },
            )
        }
        (&Method::POST, ["domains", "approve", domain]) => {
            gateway.access().approve_domain(&decode_path_segment(domain)?)?;
            json_response(
                StatusCode::OK,
                &Message {
                    message: "domain approved",
                },
            )
        }
        (&Method::POST, ["cache", "clear"]) => {
            let key = query_param(req.uri().query(), "cpf")
                .filter(|key| !key.is_empty())
                .ok_or_else(|| GatewayError::BadRequest("cpf parameter is required".into()))?;
            gateway.cache().invalidate(&key).await?;
            info!(key = %key, "cache entry cleared");
            json_response(
                StatusCode::OK,
                &Message {
                    message: "cache cleared",
                },
            )
        }
        _ => Err(GatewayError::NotFound(path.clone())),
    }
}

fn metrics<S: KeyValueStore>(gateway: &Gateway<S>) -> Result<Response<Full<Bytes>>> {
    let pending_domains = gateway
        .access()
        .snapshot()
        .pending
        .into_iter()
        .map(|pending| (pending.domain, pending.request_count))
        .collect();

    json_response(
        StatusCode::OK,
        &AdminMetrics {
            counters: gateway.metrics().snapshot(),
            pending_domains,
        },
    )
}

/// Splits an admin path into its non-empty segments after [`ADMIN_PREFIX`].
fn route_segments(path: &str) -> Vec<&str> {
    path.strip_prefix(ADMIN_PREFIX)
        .unwrap_or(path)
        .split('/')
        .filter(|s| !s.is_empty())
        .collect()
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

async fn read_json<B, T>(req: Request<B>) -> Result<T>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    T: DeserializeOwned,
{
    if headers::is_smuggling_attempt(req.headers()) {
        warn!("request smuggling attempt detected");
        return Err(GatewayError::BadRequest(
            "both Content-Length and Transfer-Encoding present".into(),
        ));
    }
    if headers::content_length_exceeds(req.headers(), MAX_BODY_BYTES) {
        return Err(GatewayError::BadRequest(format!(
            "body exceeds {MAX_BODY_BYTES} bytes"
        )));
    }

    let body = Limited::new(req.into_body(), MAX_BODY_BYTES as usize)
        .collect()
        .await
        .map_err(|e| GatewayError::BadRequest(format!("failed to read body: {e}")))?
        .to_bytes();

    serde_json::from_slice(&body)
        .map_err(|e| GatewayError::BadRequest(format!("invalid JSON body: {e}")))
}
