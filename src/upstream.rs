//! Client for the upstream identity-lookup service.
//!
//! A lookup is one `GET {endpoint}?cpf={key}&token={token}`. The whole
//! exchange, body included, is bounded by the configured timeout and is
//! attempted exactly once. Bodies larger than [`MAX_BODY_BYTES`] are
//! refused. The token is never written to logs.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Empty, Limited};
use hyper::{StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::cache::CacheRecord;
use crate::config::{RuntimeConfig, Secret};
use crate::{headers, tls};

/// The HTTP(S) client type used for upstream lookups.
pub type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Empty<Bytes>>;

/// Largest upstream payload accepted (1 MiB).
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Status given to records freshly fetched from upstream.
pub const DEFAULT_STATUS: &str = "REGULAR";

/// Why an upstream call produced no payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    /// Upstream status when it answered with a non-2xx code.
    pub status: Option<StatusCode>,
    pub message: String,
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "upstream returned {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Issues lookups against the configured endpoint.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: HttpsClient,
    endpoint: Url,
    token: Secret,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(endpoint: Url, token: Secret, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(tls::build_https_connector());
        Self {
            client,
            endpoint,
            token,
            timeout,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            config.upstream_endpoint.clone(),
            config.upstream_token.clone(),
            config.upstream_timeout,
        )
    }

    /// Fetches the raw payload for `key`.
    ///
    /// Transport failures, timeouts and non-2xx answers are all errors; a
    /// non-2xx answer carries the upstream status.
    pub async fn fetch(&self, key: &str) -> Result<Bytes, UpstreamError> {
        let uri = self.lookup_uri(key)?;
        let start = std::time::Instant::now();

        let exchange = async move {
            let resp = self.client.get(uri).await.map_err(|e| UpstreamError {
                status: None,
                message: format!("upstream request failed: {e}"),
            })?;

            let status = resp.status();
            if !status.is_success() {
                return Err(UpstreamError {
                    status: Some(status),
                    message: "lookup failed".into(),
                });
            }

            if headers::content_length_exceeds(resp.headers(), MAX_BODY_BYTES as u64) {
                return Err(UpstreamError {
                    status: None,
                    message: format!("upstream body exceeds {MAX_BODY_BYTES} bytes"),
                });
            }

            Limited::new(resp.into_body(), MAX_BODY_BYTES)
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .map_err(|e| UpstreamError {
                    status: None,
                    message: format!("failed to read upstream body: {e}"),
                })
        };

        let result = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError {
                status: None,
                message: format!("upstream timed out after {:?}", self.timeout),
            }),
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(body) => debug!(key, latency_ms, bytes = body.len(), "upstream responded"),
            Err(e) => warn!(
                key,
                latency_ms,
                status = e.status.map(|s| s.as_u16()),
                error = %e,
                "upstream lookup failed"
            ),
        }
        result
    }

    fn lookup_uri(&self, key: &str) -> Result<Uri, UpstreamError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("cpf", key)
            .append_pair("token", self.token.expose());

        url.as_str().parse::<Uri>().map_err(|e| UpstreamError {
            status: None,
            message: format!("failed to build upstream URI: {e}"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(rename = "DADOS", default)]
    data: SubjectData,
}

#[derive(Debug, Default, Deserialize)]
struct SubjectData {
    #[serde(default)]
    cpf: String,
    #[serde(default)]
    nome: String,
    #[serde(default)]
    nome_mae: Option<String>,
    #[serde(default)]
    data_nascimento: Option<String>,
    #[serde(default)]
    sexo: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Decodes an upstream payload into a record stamped with `now`.
///
/// Fails when the body is not the expected JSON envelope or when the
/// subject id or name is blank.
pub fn decode_record(body: &[u8], now: DateTime<Utc>) -> Result<CacheRecord, String> {
    let payload: LookupResponse =
        serde_json::from_slice(body).map_err(|e| format!("undecodable payload: {e}"))?;
    let data = payload.data;

    let record = CacheRecord {
        subject_id: data.cpf,
        name: data.nome,
        mother_name: non_blank(data.nome_mae),
        sex: non_blank(data.sexo),
        status: DEFAULT_STATUS.into(),
        birth_date: data.data_nascimento.unwrap_or_default(),
        score: 0,
        last_checked: now,
    };

    if !record.is_valid() {
        return Err("payload lacks subject id or name".into());
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(endpoint: &str) -> UpstreamClient {
        UpstreamClient::new(
            Url::parse(endpoint).unwrap(),
            Secret::new("t0k&n"),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn lookup_uri_encodes_query_parameters() {
        let uri = client("https://lookup.example/api/cpf")
            .lookup_uri("123")
            .unwrap();
        assert_eq!(uri.host(), Some("lookup.example"));
        assert_eq!(uri.path(), "/api/cpf");
        assert_eq!(uri.query(), Some("cpf=123&token=t0k%26n"));
    }

    #[test]
    fn lookup_uri_keeps_existing_query() {
        let uri = client("http://lookup.example/q?v=2").lookup_uri("9").unwrap();
        assert_eq!(uri.query(), Some("v=2&cpf=9&token=t0k%26n"));
    }

    #[test]
    fn decode_maps_payload_fields() {
        let now = Utc::now();
        let body = br#"{"DADOS":{"cpf":"123","nome":"Ana","nome_mae":"Maria","data_nascimento":"1990-01-01","sexo":""}}"#;
        let record = decode_record(body, now).unwrap();

        assert_eq!(record.subject_id, "123");
        assert_eq!(record.name, "Ana");
        assert_eq!(record.mother_name.as_deref(), Some("Maria"));
        assert_eq!(record.sex, None);
        assert_eq!(record.birth_date, "1990-01-01");
        assert_eq!(record.status, DEFAULT_STATUS);
        assert_eq!(record.score, 0);
        assert_eq!(record.last_checked, now);
    }

    #[test]
    fn decode_rejects_blank_mandatory_fields() {
        let now = Utc::now();
        assert!(decode_record(br#"{"DADOS":{"cpf":"","nome":""}}"#, now).is_err());
        assert!(decode_record(br#"{"DADOS":{"cpf":"1"}}"#, now).is_err());
        assert!(decode_record(br#"{}"#, now).is_err());
        assert!(decode_record(b"<html>", now).is_err());
    }

    #[tokio::test]
    async fn unreachable_upstream_has_no_status() {
        let err = client("http://127.0.0.1:1/lookup").fetch("1").await.unwrap_err();
        assert_eq!(err.status, None);
    }
}
