//! Integration tests for the accept loop over a real TCP listener.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use idgate::server::{self, ServerState};
use idgate::{Gateway, MemoryStore, RuntimeConfig};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

type TestClient = Client<HttpConnector, Full<Bytes>>;

fn test_client() -> TestClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Serves a gateway on an OS-assigned port until the returned sender fires.
async fn start_gateway(
    config: Arc<RuntimeConfig>,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind gateway");
    let addr = listener.local_addr().unwrap();
    let gateway = Arc::new(Gateway::new(config, MemoryStore::new()).unwrap());

    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server::serve(listener, ServerState::new(gateway), async move {
        let _ = rx.await;
    }));

    (addr, tx, handle)
}

fn lookup(addr: SocketAddr, key: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::GET)
        .uri(format!("http://{addr}/api/v1/cpf/{key}"))
        .header("origin", ORIGIN)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[tokio::test]
async fn serves_lookups_over_tcp_and_shuts_down() {
    init_tracing();
    let upstream = start_upstream(StatusCode::OK, ANA).await;
    let (addr, shutdown, handle) = start_gateway(test_config(upstream.addr)).await;
    let client = test_client();

    let resp = client.request(lookup(addr, "123")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/json");
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["nome"], "Ana");

    shutdown.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("serve must return after shutdown")
        .unwrap();
}

#[tokio::test]
async fn requests_beyond_concurrency_limit_get_503() {
    init_tracing();
    let upstream = start_slow_upstream(StatusCode::OK, ANA, Duration::from_millis(500)).await;
    let mut config = base_config(upstream.addr);
    config.max_concurrent_requests = Some(1);
    let (addr, _shutdown, _handle) = start_gateway(runtime(config)).await;

    let client = test_client();
    let slow = tokio::spawn({
        let client = client.clone();
        async move { client.request(lookup(addr, "123")).await.unwrap().status() }
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let resp = client.request(lookup(addr, "456")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    assert_eq!(slow.await.unwrap(), StatusCode::OK);
}
