//! Server accept loop, background tasks, and graceful shutdown.
//!
//! Sits between the TCP listener and [`Gateway::handle_request`]. Kept out
//! of `main()` so tests can drive a real listener without signal handling
//! or `std::process::exit`.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::rate_limit::CLEANUP_INTERVAL;
use crate::store::KeyValueStore;
use crate::{Gateway, GatewayError, IpRateLimiter};

/// Runtime state shared across the accept loop.
pub struct ServerState<S> {
    pub gateway: Arc<Gateway<S>>,
    /// Bounds the number of concurrent in-flight requests.
    pub semaphore: Arc<Semaphore>,
    /// Cached value of the semaphore capacity, used in error messages.
    pub concurrency_limit: usize,
}

impl<S: KeyValueStore> ServerState<S> {
    /// Builds the state with a semaphore sized from the gateway's config.
    pub fn new(gateway: Arc<Gateway<S>>) -> Self {
        let concurrency_limit = gateway.config().max_concurrent_requests;
        Self {
            gateway,
            semaphore: Arc::new(Semaphore::new(concurrency_limit)),
            concurrency_limit,
        }
    }
}

/// Accepts connections on `listener` and dispatches each request through
/// the gateway.
///
/// Runs until `shutdown` resolves, then stops accepting new connections
/// and returns. In-flight requests on already-spawned tasks continue
/// to completion independently.
pub async fn serve<S: KeyValueStore>(
    listener: TcpListener,
    state: ServerState<S>,
    shutdown: impl Future<Output = ()>,
) {
    let ServerState {
        gateway,
        semaphore,
        concurrency_limit,
    } = state;

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let gateway = Arc::clone(&gateway);
                let semaphore = Arc::clone(&semaphore);

                tokio::spawn(async move {
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let gateway = Arc::clone(&gateway);
                        let semaphore = Arc::clone(&semaphore);
                        async move {
                            let _permit = match semaphore.try_acquire() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        limit = concurrency_limit,
                                        "concurrency limit reached, rejecting request"
                                    );
                                    let err = GatewayError::ServiceUnavailable {
                                        limit: concurrency_limit,
                                    };
                                    return Ok::<_, Infallible>(err.into_response());
                                }
                            };

                            let resp = gateway
                                .handle_request(req, client_addr)
                                .await
                                .unwrap_or_else(GatewayError::into_response);
                            Ok::<_, Infallible>(resp)
                        }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await
                    {
                        warn!(%e, "connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}

/// Spawns a background task that periodically drops idle rate-limit
/// buckets, preventing unbounded memory growth.
pub fn spawn_rate_limit_cleanup(limiter: IpRateLimiter) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let before = limiter.tracked_ip_count();
            limiter.retain_recent();
            let after = limiter.tracked_ip_count();
            if before != after {
                info!(
                    before,
                    after,
                    pruned = before.saturating_sub(after),
                    "rate limiter cleanup completed"
                );
            }
        }
    })
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}
