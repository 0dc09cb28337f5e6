use std::sync::Arc;

use idgate::server::{self, ServerState};
use idgate::{
    Config, Gateway, GatewayError, KeyValueStore, MemoryStore, RedisStore, RuntimeConfig,
    StoreBackend,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const CONFIG_FILE_PATH: &str = "./Config.yml";

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| CONFIG_FILE_PATH.to_owned());

    let config = Config::load_from_file(&path)
        .and_then(|c| c.into_runtime())
        .unwrap_or_else(|e| {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        });
    let config = Arc::new(config);

    let result = match config.store_backend {
        StoreBackend::Redis => match RedisStore::connect(&config.redis).await {
            Ok(store) => run(config, store).await,
            Err(e) => Err(GatewayError::Internal(format!(
                "failed to connect to redis: {e}"
            ))),
        },
        StoreBackend::Memory => {
            warn!("using in-process store, cached records are lost on restart");
            run(config, MemoryStore::new()).await
        }
    };

    if let Err(e) = result {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run<S: KeyValueStore>(config: Arc<RuntimeConfig>, store: S) -> idgate::Result<()> {
    let gateway = Arc::new(Gateway::new(Arc::clone(&config), store)?);

    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to bind {}: {e}", config.listen)))?;

    let cleanup = server::spawn_rate_limit_cleanup(gateway.limiter().clone());

    info!(
        listen = %config.listen,
        upstream = %config.upstream_endpoint.host_str().unwrap_or_default(),
        store = ?config.store_backend,
        max_concurrent_requests = config.max_concurrent_requests,
        "gateway listening"
    );

    server::serve(listener, ServerState::new(gateway), server::shutdown_signal()).await;
    cleanup.abort();

    Ok(())
}
