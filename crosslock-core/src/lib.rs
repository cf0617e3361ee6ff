//! Crosslock relayer core.
//!
//! Watches an EVM chain and a Move-based chain for HTLC activity, pairs the
//! two legs of each atomic swap by hashlock, and completes the counter-leg
//! when a preimage is revealed. See the module docs for the individual
//! pieces; [`RelayerNode`] wires one authoritative instance of everything.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub mod bus;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod executor;
pub mod observer;
pub mod push;
pub mod storage;
pub mod swap;

pub use config::RelayerConfig;
pub use error::RelayerError;
pub use event::{Chain, ChainEvent};
pub use push::{PushHub, PushMessage, PushMessageType, Topic};
pub use storage::RelayerStorage;
pub use swap::{SwapSession, SwapStatus};

use cache::HotCache;
use coordinator::SwapCoordinator;
use executor::{ChainExecutors, WithdrawalExecutor};
use observer::evm::{EvmObserver, EvmRpcClient, EVM_SOURCE};
use observer::movechain::{MoveObserver, MoveRpcClient, MOVE_SOURCE};
use observer::{EventSink, ObserverHealth, SharedHealth};

pub const CROSSLOCK_VERSION: &str = "0.1.0";

/// The relayer process: storage, cache, observers, coordinator, executors
/// and the push hub, constructed once at startup.
pub struct RelayerNode {
    pub config: RelayerConfig,
    pub storage: Arc<RelayerStorage>,
    pub cache: Arc<HotCache>,
    pub hub: Arc<PushHub>,
    pub executor: Arc<dyn WithdrawalExecutor>,
    pub evm_health: SharedHealth,
    pub move_health: SharedHealth,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayerNode {
    /// Builds the node. Fails fast on an unreachable store or a bad signer
    /// key; both are fatal configuration problems.
    pub async fn new(config: RelayerConfig) -> anyhow::Result<Self> {
        let storage = Arc::new(
            RelayerStorage::new(
                &config.store.database_url,
                config.store.max_connections,
                config.store.busy_timeout_ms,
            )
            .await?,
        );
        let cache = Arc::new(HotCache::new(
            Duration::from_secs(config.cache.event_ttl_secs),
            Duration::from_secs(config.cache.query_ttl_secs),
            Duration::from_secs(config.expiry.terminal_grace_secs),
        ));
        let hub = Arc::new(PushHub::new(config.push.clone()));
        let executor: Arc<dyn WithdrawalExecutor> = Arc::new(ChainExecutors::new(
            config.evm.clone(),
            config.move_chain.clone(),
        )?);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            storage,
            cache,
            hub,
            executor,
            evm_health: Arc::new(tokio::sync::RwLock::new(ObserverHealth::new(EVM_SOURCE))),
            move_health: Arc::new(tokio::sync::RwLock::new(ObserverHealth::new(MOVE_SOURCE))),
            shutdown,
            tasks: Vec::new(),
        })
    }

    /// Starts every task: observers (live + backfill), the coordinator pool,
    /// the expiry sweep and the push hub. Fatal if neither observer can
    /// establish a cursor.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        tracing::info!("starting crosslock relayer v{CROSSLOCK_VERSION}");

        self.establish_cursors().await?;
        self.warm_cache().await?;

        let (bus_tx, bus_rx) = bus::channel(bus::DEFAULT_BUS_CAPACITY);
        let (lifecycle_tx, lifecycle_rx) =
            mpsc::channel(coordinator::LIFECYCLE_CHANNEL_CAPACITY);

        let coordinator = Arc::new(SwapCoordinator::new(
            self.storage.clone(),
            self.cache.clone(),
            self.executor.clone(),
            lifecycle_tx,
            self.config.monitoring.clone(),
            self.config.pairing.clone(),
        ));

        let evm_observer = EvmObserver::new(
            self.config.evm.clone(),
            self.config.monitoring.clone(),
            EventSink {
                storage: self.storage.clone(),
                cache: self.cache.clone(),
                bus: bus_tx.clone(),
                source: EVM_SOURCE,
            },
            self.evm_health.clone(),
        );
        let move_observer = MoveObserver::new(
            self.config.move_chain.clone(),
            self.config.monitoring.clone(),
            EventSink {
                storage: self.storage.clone(),
                cache: self.cache.clone(),
                bus: bus_tx,
                source: MOVE_SOURCE,
            },
            self.move_health.clone(),
        );

        self.tasks.push(tokio::spawn(
            evm_observer.run(self.shutdown.subscribe()),
        ));
        self.tasks.push(tokio::spawn(
            move_observer.run(self.shutdown.subscribe()),
        ));
        self.tasks.push(tokio::spawn(
            coordinator.clone().run(bus_rx, self.shutdown.subscribe()),
        ));
        self.tasks.push(tokio::spawn(coordinator.run_expiry_sweep(
            self.config.expiry.clone(),
            self.shutdown.subscribe(),
        )));
        self.tasks.push(tokio::spawn(
            self.hub
                .clone()
                .run(lifecycle_rx, self.shutdown.subscribe()),
        ));

        tracing::info!("crosslock relayer started");
        Ok(())
    }

    /// A cursor exists when the store already has one or the chain head is
    /// reachable. Losing one chain degrades; losing both is fatal.
    async fn establish_cursors(&self) -> anyhow::Result<()> {
        let evm_ok = match self.storage.cursor_of(EVM_SOURCE).await? {
            Some(_) => true,
            None => EvmRpcClient::new(&self.config.evm.rpc_url)
                .block_number()
                .await
                .is_ok(),
        };
        let move_ok = match self.storage.cursor_of(MOVE_SOURCE).await? {
            Some(_) => true,
            None => MoveRpcClient::new(&self.config.move_chain.rpc_url)
                .latest_checkpoint()
                .await
                .is_ok(),
        };
        if !evm_ok && !move_ok {
            anyhow::bail!("neither chain observer can establish a cursor");
        }
        if !evm_ok {
            tracing::warn!("EVM cursor not established yet; observer will keep retrying");
        }
        if !move_ok {
            tracing::warn!("Move cursor not established yet; observer will keep retrying");
        }
        Ok(())
    }

    /// Reloads non-terminal swaps into the hot cache after a restart.
    async fn warm_cache(&self) -> anyhow::Result<()> {
        let active = self.storage.active_swaps().await?;
        let count = active.len();
        for swap in active {
            self.cache.set_swap(swap);
        }
        if count > 0 {
            tracing::info!("restored {count} active swaps into the hot cache");
        }
        Ok(())
    }

    /// Graceful shutdown: observers stop, the bus drains, push sessions get
    /// a going-away frame, and the store is closed.
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        tracing::info!("shutting down crosslock relayer");
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.storage.close().await;
        tracing::info!("crosslock relayer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_node_requires_valid_signer_key() {
        let mut config = RelayerConfig::default();
        config.store.database_url = "sqlite://:memory:".into();
        config.move_chain.signer_key = "not-hex".into();
        assert!(RelayerNode::new(config).await.is_err());
    }

    #[tokio::test]
    async fn test_node_builds_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RelayerConfig::default();
        config.store.database_url =
            format!("sqlite://{}/crosslock.db", dir.path().to_string_lossy());
        config.move_chain.signer_key = format!("0x{}", hex::encode([7u8; 32]));
        let node = RelayerNode::new(config).await;
        assert!(node.is_ok());
    }
}
