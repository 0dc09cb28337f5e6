//! Error types and HTTP status code mapping.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use std::fmt;

use crate::access::{DenyReason, DomainError};
use crate::cache::CacheError;

/// Every failure the gateway can produce, each mapping to a specific HTTP status.
#[derive(Debug)]
pub enum GatewayError {
    /// The configuration file could not be loaded, parsed or validated.
    Config(String),
    /// The client was rejected by the IP or origin allow-lists.
    AdmissionDenied(DenyReason),
    /// The client exhausted its token bucket.
    RateLimited {
        /// Estimated wait, in milliseconds, until the next token is available.
        retry_after_ms: u64,
    },
    /// The upstream lookup service failed, timed out or answered non-2xx.
    UpstreamUnavailable {
        /// Upstream status code, when the upstream answered at all.
        status: Option<StatusCode>,
        message: String,
    },
    /// The subject key is malformed or the upstream returned no usable subject.
    InvalidSubject(String),
    /// The key-value store could not be reached.
    Cache(CacheError),
    /// An internal error that does not fit other categories.
    Internal(String),
    /// The admin token is missing or wrong.
    Unauthorized,
    /// An administrative domain operation was refused.
    Domain(DomainError),
    /// The request is malformed (bad JSON body, missing parameter).
    BadRequest(String),
    /// No route matches the request path.
    NotFound(String),
    /// The concurrency limit was reached.
    ServiceUnavailable { limit: usize },
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::AdmissionDenied(reason) => write!(f, "access denied: {reason}"),
            Self::RateLimited { retry_after_ms } => {
                write!(f, "rate limit exceeded, retry after {retry_after_ms} ms")
            }
            Self::UpstreamUnavailable {
                status: Some(status),
                message,
            } => write!(f, "upstream error ({status}): {message}"),
            Self::UpstreamUnavailable {
                status: None,
                message,
            } => write!(f, "upstream error: {message}"),
            Self::InvalidSubject(msg) => write!(f, "invalid subject: {msg}"),
            Self::Cache(err) => write!(f, "cache error: {err}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
            Self::Unauthorized => f.write_str("unauthorized"),
            Self::Domain(err) => write!(f, "{err}"),
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::NotFound(path) => write!(f, "no route for {path}"),
            Self::ServiceUnavailable { limit } => {
                write!(f, "too many concurrent requests (limit {limit})")
            }
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Internal(_) | Self::Cache(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::AdmissionDenied(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable { status, .. } => status.unwrap_or(StatusCode::BAD_GATEWAY),
            Self::InvalidSubject(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Domain(DomainError::AlreadyExists | DomainError::AlreadyApproved) => {
                StatusCode::BAD_REQUEST
            }
            Self::Domain(DomainError::NotFound | DomainError::NotPending) | Self::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Short machine-readable code placed in the `error` field of the body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::AdmissionDenied(reason) => reason.code(),
            Self::RateLimited { .. } => "rate_limited",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::InvalidSubject(_) => "invalid_subject",
            Self::Cache(_) => "cache_error",
            Self::Internal(_) => "internal_error",
            Self::Unauthorized => "unauthorized",
            Self::Domain(err) => err.code(),
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::ServiceUnavailable { .. } => "service_unavailable",
        }
    }

    /// Converts this error into an HTTP response with a JSON body.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });

        let mut builder = Response::builder()
            .status(status)
            .header("content-type", "application/json");

        if let Self::RateLimited { retry_after_ms } = &self {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            builder = builder.header("retry-after", secs.to_string());
        }

        builder
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap_or_else(|_| {
                let mut fallback = Response::new(Full::new(Bytes::new()));
                *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                fallback
            })
    }
}

impl From<DenyReason> for GatewayError {
    fn from(reason: DenyReason) -> Self {
        Self::AdmissionDenied(reason)
    }
}

impl From<DomainError> for GatewayError {
    fn from(err: DomainError) -> Self {
        Self::Domain(err)
    }
}

impl From<CacheError> for GatewayError {
    fn from(err: CacheError) -> Self {
        Self::Cache(err)
    }
}

impl From<hyper::http::Error> for GatewayError {
    fn from(err: hyper::http::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_is_propagated() {
        let err = GatewayError::UpstreamUnavailable {
            status: Some(StatusCode::NOT_FOUND),
            message: "not found".into(),
        };
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = GatewayError::UpstreamUnavailable {
            status: None,
            message: "connection refused".into(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let resp = GatewayError::RateLimited {
            retry_after_ms: 1500,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["retry-after"], "2");
    }

    #[test]
    fn domain_errors_map_to_client_statuses() {
        assert_eq!(
            GatewayError::from(DomainError::NotPending).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::from(DomainError::AlreadyApproved).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn admission_denial_is_forbidden() {
        let resp = GatewayError::from(DenyReason::OriginPending).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
