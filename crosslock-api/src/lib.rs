/// Admin REST surface and WebSocket push endpoint for the Crosslock relayer.
pub mod error;
pub mod models;
pub mod routes;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crosslock_core::cache::HotCache;
use crosslock_core::executor::WithdrawalExecutor;
use crosslock_core::observer::SharedHealth;
use crosslock_core::{PushHub, RelayerConfig, RelayerNode, RelayerStorage};

/// Shared handles the routes work against. Everything is owned by the
/// relayer node; the API only borrows.
pub struct AppState {
    pub storage: Arc<RelayerStorage>,
    pub cache: Arc<HotCache>,
    pub hub: Arc<PushHub>,
    pub executor: Arc<dyn WithdrawalExecutor>,
    pub evm_health: SharedHealth,
    pub move_health: SharedHealth,
}

pub fn init_observability() -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    Ok(())
}

pub struct ApiServer {
    config: RelayerConfig,
    node: RelayerNode,
}

impl ApiServer {
    pub async fn new(config: RelayerConfig) -> Result<Self> {
        let node = RelayerNode::new(config.clone()).await?;
        Ok(Self { config, node })
    }

    /// Starts the relayer tasks and serves HTTP until shutdown is signalled.
    pub async fn run(mut self) -> Result<()> {
        self.node.start().await?;

        let state = Arc::new(AppState {
            storage: self.node.storage.clone(),
            cache: self.node.cache.clone(),
            hub: self.node.hub.clone(),
            executor: self.node.executor.clone(),
            evm_health: self.node.evm_health.clone(),
            move_health: self.node.move_health.clone(),
        });
        let app = create_router(state);

        let addr = format!("{}:{}", self.config.api.host, self.config.api.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("crosslock API listening on http://{addr}");
        info!("push endpoint at ws://{addr}/ws");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.node.shutdown().await?;
        Ok(())
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health::router())
        .merge(routes::swaps::router())
        .merge(routes::websocket::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
    info!("shutdown signal received");
}
