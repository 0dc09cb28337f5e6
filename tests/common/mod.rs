//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway upstream lookup servers with call counters,
//! configuration builders, gateway constructors over an in-process store,
//! and request helpers used across all integration test modules.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use idgate::config::{StoreConfig, UpstreamConfig};
use idgate::{
    Config, Gateway, GatewayError, KeyValueStore, MemoryStore, RuntimeConfig, StoreBackend,
    StoreError,
};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

pub const ADMIN_TOKEN: &str = "test-admin-token";
pub const UPSTREAM_TOKEN: &str = "up&stream";
pub const ORIGIN: &str = "https://app.example.com";

/// Upstream payload for subject `123`.
pub const ANA: &str = r#"{"DADOS":{"cpf":"123","nome":"Ana","nome_mae":"Maria","data_nascimento":"1990-01-01","sexo":"F"}}"#;

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

/// A running fake upstream lookup service.
pub struct Upstream {
    pub addr: SocketAddr,
    calls: Arc<AtomicUsize>,
    last_query: Arc<Mutex<Option<String>>>,
    _shutdown: oneshot::Sender<()>,
}

impl Upstream {
    /// Number of requests the upstream has received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Raw query string of the most recent request.
    pub fn last_query(&self) -> Option<String> {
        self.last_query.lock().clone()
    }
}

/// Starts a local upstream that answers every request with `status` and a
/// JSON `body`.
pub async fn start_upstream(status: StatusCode, body: &'static str) -> Upstream {
    start_slow_upstream(status, body, Duration::ZERO).await
}

/// Like [`start_upstream`], sleeping for `delay` before answering.
pub async fn start_slow_upstream(
    status: StatusCode,
    body: &'static str,
    delay: Duration,
) -> Upstream {
    let (tx, rx) = oneshot::channel::<()>();
    let calls = Arc::new(AtomicUsize::new(0));
    let last_query = Arc::new(Mutex::new(None));

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test upstream");
    let addr = listener.local_addr().unwrap();

    let server_calls = Arc::clone(&calls);
    let server_query = Arc::clone(&last_query);
    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let calls = Arc::clone(&server_calls);
                    let last_query = Arc::clone(&server_query);
                    let service = service_fn(move |req: Request<Incoming>| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        *last_query.lock() = req.uri().query().map(str::to_owned);
                        async move {
                            tokio::time::sleep(delay).await;
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .status(status)
                                    .header("content-type", "application/json")
                                    .body(Full::new(Bytes::from(body)))
                                    .expect("test response must build"),
                            )
                        }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    Upstream {
        addr,
        calls,
        last_query,
        _shutdown: tx,
    }
}

/// Baseline configuration pointing at a local upstream, with an in-process
/// store and [`ORIGIN`] as the only allowed origin.
pub fn base_config(upstream: SocketAddr) -> Config {
    Config {
        admin_token: ADMIN_TOKEN.into(),
        allowed_origins: vec![ORIGIN.into()],
        upstream: UpstreamConfig {
            endpoint: format!("http://{upstream}/lookup"),
            token: UPSTREAM_TOKEN.into(),
            timeout_ms: Some(2000),
        },
        store: StoreConfig {
            backend: StoreBackend::Memory,
            timeout_ms: Some(500),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn test_config(upstream: SocketAddr) -> Arc<RuntimeConfig> {
    runtime(base_config(upstream))
}

pub fn runtime(config: Config) -> Arc<RuntimeConfig> {
    Arc::new(config.into_runtime().expect("test config must be valid"))
}

/// Builds a gateway over a fresh [`MemoryStore`], returning a handle on the
/// same store for inspection.
pub fn test_gateway(config: Arc<RuntimeConfig>) -> (Gateway<MemoryStore>, MemoryStore) {
    let store = MemoryStore::new();
    let gateway = Gateway::new(config, store.clone()).expect("gateway must build");
    (gateway, store)
}

/// Store that reads as empty but refuses every write.
#[derive(Debug, Clone, Default)]
pub struct WriteFailingStore;

impl KeyValueStore for WriteFailingStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError("READONLY You can't write against a read only replica".into()))
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A lookup for `key`, optionally carrying an `Origin` header.
pub fn lookup_request(key: &str, origin: Option<&str>) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(format!("/api/v1/cpf/{key}"));
    if let Some(origin) = origin {
        builder = builder.header("origin", origin);
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}

/// An admin request carrying the correct token.
pub fn admin_request(method: Method, path: &str, body: Option<&str>) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("x-admin-token", ADMIN_TOKEN);
    if body.is_some() {
        builder = builder.header("content-type", "application/json");
    }
    builder
        .body(Full::new(Bytes::from(body.unwrap_or_default().to_owned())))
        .unwrap()
}

/// Runs `req` through the gateway, turning errors into their HTTP response
/// the way the server does.
pub async fn send<S: KeyValueStore>(
    gateway: &Gateway<S>,
    req: Request<Full<Bytes>>,
) -> Response<Full<Bytes>> {
    gateway
        .handle_request(req, test_addr())
        .await
        .unwrap_or_else(GatewayError::into_response)
}

/// Collects a response body into raw bytes.
pub async fn body_bytes(resp: Response<Full<Bytes>>) -> Bytes {
    resp.into_body()
        .collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

/// Collects a response body and parses it as JSON.
pub async fn body_json(resp: Response<Full<Bytes>>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(resp).await).expect("response body must be JSON")
}
