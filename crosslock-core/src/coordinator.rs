//! Swap coordinator: the per-swap state machine.
//!
//! Sole consumer of the event bus. The dispatcher routes every event to the
//! worker that owns its swap — keyed by hashlock, which uniquely identifies
//! the session — so all mutations of one swap are serialized on a single
//! partition while unrelated swaps proceed in parallel. Transitions are
//! single repository mutations; chain calls go through the withdrawal
//! executor and never hold a repository transaction open.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};

use crate::cache::HotCache;
use crate::config::{ExpiryConfig, MonitoringConfig, PairingConfig};
use crate::error::RelayerError;
use crate::event::{Chain, ChainEvent};
use crate::executor::{ExecutionError, WithdrawalExecutor};
use crate::push::{LifecycleEvent, LifecycleKind};
use crate::storage::RelayerStorage;
use crate::swap::{verify_preimage, NewSwap, SwapSession, SwapStatus};

/// Upper bound on accepted timelocks.
pub const MAX_TIMELOCK_AHEAD_SECS: u64 = 365 * 24 * 3600;

pub const LIFECYCLE_CHANNEL_CAPACITY: usize = 1024;

const ROUTE_TABLE_MAX: usize = 10_000;
const ROUTE_TABLE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Dispatcher-side map from `(chain, contract_id)` to the owning hashlock,
/// learned from Created events as they pass through. The bus is FIFO per
/// source, so a contract's later events always find their entry here while
/// the Created is still in flight; anything older resolves from the store.
type RouteTable = HashMap<String, (String, Instant)>;

pub struct SwapCoordinator {
    storage: Arc<RelayerStorage>,
    cache: Arc<HotCache>,
    executor: Arc<dyn WithdrawalExecutor>,
    lifecycle: mpsc::Sender<LifecycleEvent>,
    monitoring: MonitoringConfig,
    pairing: PairingConfig,
}

impl SwapCoordinator {
    pub fn new(
        storage: Arc<RelayerStorage>,
        cache: Arc<HotCache>,
        executor: Arc<dyn WithdrawalExecutor>,
        lifecycle: mpsc::Sender<LifecycleEvent>,
        monitoring: MonitoringConfig,
        pairing: PairingConfig,
    ) -> Self {
        Self {
            storage,
            cache,
            executor,
            lifecycle,
            monitoring,
            pairing,
        }
    }

    /// Drains the bus until it closes or shutdown fires. Spawns the worker
    /// pool and routes each event to the partition owning its swap.
    pub async fn run(
        self: Arc<Self>,
        mut bus: crate::bus::BusReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let workers = num_cpus::get().clamp(2, 8);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, mut rx) = mpsc::channel::<ChainEvent>(256);
            senders.push(tx);
            let coordinator = self.clone();
            handles.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    coordinator.process_with_retry(event).await;
                }
                tracing::debug!("coordinator worker {index} drained");
            }));
        }

        tracing::info!("swap coordinator started with {workers} workers");
        let mut routes = RouteTable::new();
        loop {
            tokio::select! {
                event = bus.next() => {
                    match event {
                        Some(event) => {
                            let key = self.swap_key(&mut routes, &event).await;
                            let index = partition_index(&key, workers);
                            if senders[index].send(event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        drop(senders);
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("swap coordinator stopped");
    }

    /// Serialization key for an event: the swap's hashlock. Created events
    /// carry it directly and register their contract in the route table;
    /// later events for the same contract resolve through the table (while
    /// their Created is still queued) or the durable swap row (after a
    /// restart). Only true orphans fall back to the contract key, and an
    /// orphan has no swap to race.
    async fn swap_key(&self, routes: &mut RouteTable, event: &ChainEvent) -> String {
        let key = route_for(routes, event);
        match key {
            Some(hashlock) => hashlock,
            None => {
                let meta = event.meta();
                match self
                    .storage
                    .find_by_contract(meta.chain, &meta.contract_id)
                    .await
                {
                    Ok(Some(swap)) => swap.hashlock,
                    _ => format!("{}:{}", meta.chain, meta.contract_id),
                }
            }
        }
    }

    async fn process_with_retry(&self, event: ChainEvent) {
        let mut attempt = 0u32;
        loop {
            match self.handle_event(&event).await {
                Ok(()) => return,
                Err(e) if e.is_transient() && attempt < self.monitoring.max_retries => {
                    attempt += 1;
                    let delay =
                        Duration::from_millis(self.monitoring.retry_delay_ms * u64::from(attempt));
                    tracing::warn!(
                        "retrying event {} after transient error ({attempt}/{}): {e}",
                        event.idempotency_key(),
                        self.monitoring.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!("event {} failed: {e}", event.idempotency_key());
                    if let Err(log_err) = self.storage.record_error(&event, &e.to_string()).await {
                        tracing::error!("error log write failed: {log_err}");
                    }
                    return;
                }
            }
        }
    }

    /// Processing one event is the unit of work.
    pub async fn handle_event(&self, event: &ChainEvent) -> Result<(), RelayerError> {
        match event {
            ChainEvent::Created {
                meta,
                sender,
                receiver,
                token,
                amount,
                hashlock,
                timelock,
                ..
            } => {
                self.handle_created(
                    meta.chain,
                    &meta.contract_id,
                    &meta.tx_hash,
                    sender,
                    receiver,
                    token,
                    amount,
                    hashlock,
                    *timelock,
                )
                .await
            }
            ChainEvent::Withdrawn { meta, preimage } => {
                self.handle_withdrawn(meta.chain, &meta.contract_id, preimage)
                    .await
            }
            ChainEvent::Refunded { meta } => {
                self.handle_refunded(meta.chain, &meta.contract_id, &meta.tx_hash)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_created(
        &self,
        chain: Chain,
        contract_id: &str,
        tx_hash: &str,
        sender: &str,
        receiver: &str,
        token: &str,
        amount: &str,
        hashlock: &str,
        timelock: u64,
    ) -> Result<(), RelayerError> {
        let now = Utc::now().timestamp() as u64;
        if timelock <= now {
            tracing::warn!("ignoring HTLC on {chain} with expired timelock ({contract_id})");
            return Err(RelayerError::InvalidTimelock("timelock in the past".into()));
        }
        if timelock > now + MAX_TIMELOCK_AHEAD_SECS {
            tracing::warn!("ignoring HTLC on {chain} with oversized timelock ({contract_id})");
            return Err(RelayerError::InvalidTimelock(
                "timelock exceeds one year".into(),
            ));
        }

        if let Some(swap) = self.storage.find_by_hashlock(hashlock).await? {
            return self
                .pair_second_side(swap, chain, contract_id, sender, receiver, amount)
                .await;
        }

        let mut swap = NewSwap {
            source_chain: chain,
            source_contract_id: contract_id,
            hashlock,
            initiator: sender,
            receiver,
            token,
            amount,
            timelock,
            source_tx_hash: tx_hash,
        }
        .build()?;
        // Lock the source side before the row becomes visible, so a
        // concurrent pairing never sees a half-created PENDING swap.
        swap.transition(SwapStatus::SourceLocked)?;
        let swap_id = swap.swap_id.clone();

        if !self.storage.create_swap_if_absent(&swap).await? {
            // Lost the insert race to the other leg: the unique hashlock
            // index rejected us, so the winner must now be visible.
            tracing::debug!("swap for hashlock {hashlock} created concurrently");
            let winner = self
                .storage
                .find_by_hashlock(hashlock)
                .await?
                .ok_or_else(|| {
                    RelayerError::Storage(format!("swap id collision for hashlock {hashlock}"))
                })?;
            return self
                .pair_second_side(winner, chain, contract_id, sender, receiver, amount)
                .await;
        }

        self.cache.set_swap(swap.clone());
        self.cache.invalidate_queries();
        tracing::info!(
            "swap {swap_id} created from {chain} HTLC {contract_id} (hashlock {hashlock})"
        );
        self.emit(LifecycleKind::Created, swap, None);
        Ok(())
    }

    /// Second HTLC_CREATED for a known hashlock: fill the other side and
    /// check compatibility. Token may differ (cross-asset swaps); the amount
    /// must match, and when a party rule is configured, the legs' sender and
    /// receiver must be linked addresses of the same participants.
    async fn pair_second_side(
        &self,
        swap: SwapSession,
        chain: Chain,
        contract_id: &str,
        sender: &str,
        receiver: &str,
        amount: &str,
    ) -> Result<(), RelayerError> {
        if swap.status.is_terminal() {
            tracing::warn!(
                "ignoring HTLC {contract_id} on {chain}: swap {} is terminal",
                swap.swap_id
            );
            return Ok(());
        }
        if let Some(existing) = swap.contract_id_on(chain) {
            if existing == contract_id {
                return Ok(());
            }
            tracing::warn!(
                "swap {} already has a {chain} side; ignoring HTLC {contract_id}",
                swap.swap_id
            );
            return Ok(());
        }

        let mut mismatch = None;
        if !amounts_match(&swap.amount, amount) {
            mismatch = Some(format!(
                "{chain} HTLC {contract_id} amount {amount} vs {}",
                swap.amount
            ));
        } else if self.pairing.require_party_match
            && !self.parties_linked(&swap, chain, sender, receiver)
        {
            mismatch = Some(format!(
                "{chain} HTLC {contract_id} parties are not linked to the originating leg"
            ));
        }
        if let Some(detail) = mismatch {
            let message = RelayerError::PairingMismatch(detail).to_string();
            let updated = self
                .storage
                .update_swap(&swap.swap_id, |s| {
                    s.push_error(message.clone());
                    s.transition(SwapStatus::Failed)
                })
                .await?;
            self.cache.set_swap(updated.clone());
            tracing::warn!("swap {} failed: {message}", updated.swap_id);
            self.emit(
                LifecycleKind::Error,
                updated,
                Some("pairing mismatch".into()),
            );
            return Ok(());
        }

        let contract = contract_id.to_string();
        let updated = self
            .storage
            .update_swap(&swap.swap_id, move |s| {
                s.set_contract_id(chain, contract.clone());
                s.transition(SwapStatus::BothLocked)
            })
            .await?;
        self.cache.set_swap(updated.clone());
        self.cache.invalidate_queries();
        tracing::info!("swap {} is locked on both chains", updated.swap_id);
        self.emit(LifecycleKind::StatusChanged, updated.clone(), None);

        // A preimage revealed before this leg was observed still owes a
        // counter-withdrawal: this freshly locked side is the unclaimed one.
        if let Some(preimage) = updated.preimage.clone() {
            let revealed = self
                .storage
                .update_swap(&updated.swap_id, |s| {
                    s.transition(SwapStatus::PreimageRevealed)
                })
                .await?;
            self.cache.set_swap(revealed.clone());
            self.emit(LifecycleKind::StatusChanged, revealed.clone(), None);
            return self
                .counter_withdraw(revealed, chain, contract_id, &preimage)
                .await;
        }
        Ok(())
    }

    /// Checks both participants across the two legs against the configured
    /// address links. The first leg's sender/receiver live on the source
    /// chain; the second leg's live on `chain`. Each participant's pair of
    /// addresses must appear in `pairing.party_links`: the initiator is paid
    /// on the new leg (first sender ↔ second receiver) and the counterparty
    /// on the original one (first receiver ↔ second sender).
    fn parties_linked(
        &self,
        swap: &SwapSession,
        chain: Chain,
        sender: &str,
        receiver: &str,
    ) -> bool {
        match chain {
            // Source leg is EVM; the new leg's addresses are Move-side.
            Chain::Move => {
                self.pairing.linked(&swap.initiator, receiver)
                    && self.pairing.linked(&swap.receiver, sender)
            }
            // Source leg is Move; the new leg's addresses are EVM-side.
            Chain::Evm => {
                self.pairing.linked(receiver, &swap.initiator)
                    && self.pairing.linked(sender, &swap.receiver)
            }
        }
    }

    async fn handle_withdrawn(
        &self,
        chain: Chain,
        contract_id: &str,
        preimage: &str,
    ) -> Result<(), RelayerError> {
        let swap = match self.storage.find_by_contract(chain, contract_id).await? {
            Some(swap) => swap,
            None => {
                tracing::warn!("orphan withdrawal on {chain} for contract {contract_id}");
                return Ok(());
            }
        };
        if swap.status.is_terminal() {
            tracing::debug!(
                "withdrawal for terminal swap {} ignored (absorbing)",
                swap.swap_id
            );
            return Ok(());
        }

        if !verify_preimage(preimage, &swap.hashlock)? {
            let message = RelayerError::PreimageMismatch.to_string();
            let updated = self
                .storage
                .update_swap(&swap.swap_id, |s| {
                    s.push_error(message.clone());
                    s.transition(SwapStatus::Failed)
                })
                .await?;
            self.cache.set_swap(updated.clone());
            tracing::warn!(
                "swap {} failed: revealed preimage does not hash to the lock",
                updated.swap_id
            );
            self.emit(LifecycleKind::Error, updated, Some(message));
            return Ok(());
        }

        let preimage_owned = preimage.to_string();
        let updated = self
            .storage
            .update_swap(&swap.swap_id, move |s| {
                s.preimage = Some(preimage_owned.clone());
                if s.status == SwapStatus::BothLocked {
                    s.transition(SwapStatus::PreimageRevealed)?;
                } else {
                    // Counterparty HTLC was never observed; keep the preimage
                    // but there is nothing to counter-withdraw yet.
                    s.touch();
                }
                Ok(())
            })
            .await?;
        self.cache.set_swap(updated.clone());

        if updated.status != SwapStatus::PreimageRevealed {
            tracing::warn!(
                "swap {} revealed a preimage with only one side locked",
                updated.swap_id
            );
            self.emit(LifecycleKind::Updated, updated, None);
            return Ok(());
        }
        self.emit(LifecycleKind::StatusChanged, updated.clone(), None);

        // The reveal happened on `chain`; claim the opposite side.
        let target_chain = chain.other();
        let target_contract = match updated.contract_id_on(target_chain) {
            Some(contract) => contract.to_string(),
            None => {
                tracing::error!(
                    "swap {} in PREIMAGE_REVEALED without a {target_chain} side",
                    updated.swap_id
                );
                return Ok(());
            }
        };
        self.counter_withdraw(updated, target_chain, &target_contract, preimage)
            .await
    }

    /// Claims the opposite side with the revealed preimage, retrying
    /// transient failures up to the swap's retry budget.
    async fn counter_withdraw(
        &self,
        swap: SwapSession,
        target_chain: Chain,
        target_contract: &str,
        preimage: &str,
    ) -> Result<(), RelayerError> {
        let swap_id = swap.swap_id.clone();
        let max_retries = swap.max_retries;
        let mut attempt = 0u32;

        loop {
            match self
                .executor
                .withdraw(target_chain, target_contract, preimage)
                .await
            {
                Ok(tx_hash) => {
                    let updated = self
                        .storage
                        .update_swap(&swap_id, move |s| {
                            s.target_tx_hash = Some(tx_hash.clone());
                            s.transition(SwapStatus::Completed)
                        })
                        .await?;
                    self.cache.set_swap(updated.clone());
                    self.cache.invalidate_queries();
                    tracing::info!("swap {swap_id} completed via {target_chain} withdrawal");
                    self.emit(LifecycleKind::StatusChanged, updated.clone(), None);
                    self.emit(LifecycleKind::Updated, updated, None);
                    return Ok(());
                }
                Err(ExecutionError::AlreadySettled(detail)) => {
                    // The counterparty (or a previous run) beat us to it.
                    let updated = self
                        .storage
                        .update_swap(&swap_id, |s| s.transition(SwapStatus::Completed))
                        .await?;
                    self.cache.set_swap(updated.clone());
                    tracing::info!("swap {swap_id} already settled on-chain: {detail}");
                    self.emit(LifecycleKind::StatusChanged, updated.clone(), None);
                    self.emit(LifecycleKind::Updated, updated, None);
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt + 1 < max_retries => {
                    attempt += 1;
                    let bump = self
                        .storage
                        .update_swap(&swap_id, |s| {
                            s.retry_count += 1;
                            s.touch();
                            Ok(())
                        })
                        .await?;
                    self.cache.set_swap(bump);
                    let delay =
                        Duration::from_millis(self.monitoring.retry_delay_ms * u64::from(attempt));
                    tracing::warn!(
                        "withdrawal for swap {swap_id} failed transiently ({attempt}/{max_retries}): {e}; retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let reason = format!("counter-withdrawal failed: {e}");
                    let reason_for_update = reason.clone();
                    let updated = self
                        .storage
                        .update_swap(&swap_id, move |s| {
                            s.push_error(reason_for_update.clone());
                            s.transition(SwapStatus::Failed)
                        })
                        .await?;
                    self.cache.set_swap(updated.clone());
                    tracing::error!("swap {swap_id} failed: {reason}");
                    self.emit(LifecycleKind::Error, updated, Some(reason));
                    return Ok(());
                }
            }
        }
    }

    async fn handle_refunded(
        &self,
        chain: Chain,
        contract_id: &str,
        tx_hash: &str,
    ) -> Result<(), RelayerError> {
        let swap = match self.storage.find_by_contract(chain, contract_id).await? {
            Some(swap) => swap,
            None => {
                tracing::warn!("orphan refund on {chain} for contract {contract_id}");
                return Ok(());
            }
        };
        if swap.status.is_terminal() {
            tracing::debug!("refund for terminal swap {} ignored", swap.swap_id);
            return Ok(());
        }

        let tx = tx_hash.to_string();
        let updated = self
            .storage
            .update_swap(&swap.swap_id, move |s| {
                s.refund_tx_hash = Some(tx.clone());
                s.transition(SwapStatus::Refunded)
            })
            .await?;
        self.cache.set_swap(updated.clone());
        self.cache.invalidate_queries();
        tracing::info!("swap {} refunded on {chain}", updated.swap_id);
        self.emit(LifecycleKind::StatusChanged, updated.clone(), None);
        self.emit(LifecycleKind::Updated, updated, None);
        Ok(())
    }

    /// Times out every non-terminal swap whose deadline has passed. The
    /// relayer never force-refunds user funds; the on-chain timelock lets
    /// participants refund themselves.
    pub async fn expire_overdue(&self) -> Result<usize, RelayerError> {
        let overdue = self.storage.expire_scan(Utc::now()).await?;
        let mut expired = 0usize;
        for swap_id in overdue {
            match self
                .storage
                .update_swap(&swap_id, |s| {
                    s.push_error("timeout");
                    s.transition(SwapStatus::Failed)
                })
                .await
            {
                Ok(updated) => {
                    self.cache.set_swap(updated.clone());
                    tracing::warn!("swap {swap_id} expired");
                    self.emit(LifecycleKind::Error, updated, Some("timeout".into()));
                    expired += 1;
                }
                // Lost the race against a concurrent terminal transition.
                Err(RelayerError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if expired > 0 {
            self.cache.invalidate_queries();
        }
        Ok(expired)
    }

    /// Periodic expiry sweep; runs once immediately, then on the interval.
    pub async fn run_expiry_sweep(
        self: Arc<Self>,
        expiry: ExpiryConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(expiry.sweep_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.expire_overdue().await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("expiry sweep timed out {n} swaps"),
                        Err(e) => tracing::error!("expiry sweep failed: {e}"),
                    }
                    self.cache.cleanup_expired();
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    fn emit(&self, kind: LifecycleKind, swap: SwapSession, note: Option<String>) {
        let event = LifecycleEvent { kind, swap, note };
        if self.lifecycle.try_send(event).is_err() {
            tracing::warn!("lifecycle channel full; dropping push notification");
        }
    }
}

/// In-memory half of [`SwapCoordinator::swap_key`]: registers Created
/// events and answers from the table. `None` means the caller must consult
/// the store.
fn route_for(routes: &mut RouteTable, event: &ChainEvent) -> Option<String> {
    let meta = event.meta();
    let contract = format!("{}:{}", meta.chain, meta.contract_id);
    if let ChainEvent::Created { hashlock, .. } = event {
        if routes.len() >= ROUTE_TABLE_MAX {
            routes.retain(|_, (_, seen)| seen.elapsed() < ROUTE_TABLE_MAX_AGE);
        }
        routes.insert(contract, (hashlock.clone(), Instant::now()));
        return Some(hashlock.clone());
    }
    routes.get(&contract).map(|(hashlock, _)| hashlock.clone())
}

fn partition_index(key: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % workers
}

/// Compares decimal-string amounts numerically.
fn amounts_match(a: &str, b: &str) -> bool {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_index_is_stable() {
        let a = partition_index("0xabc", 4);
        assert_eq!(a, partition_index("0xabc", 4));
        assert!(a < 4);
    }

    fn move_meta(contract_byte: u8) -> crate::event::EventMeta {
        crate::event::EventMeta {
            chain: Chain::Move,
            contract_id: format!("0x{}", hex::encode([contract_byte; 32])),
            tx_hash: format!("0x{}", hex::encode([0x11; 32])),
            log_index: 0,
            position: 7,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_route_table_keys_contract_events_by_hashlock() {
        let mut routes = RouteTable::new();
        let hashlock = format!("0x{}", hex::encode([0x77; 32]));
        let created = ChainEvent::Created {
            meta: move_meta(0xb2),
            sender: "0xmove_b".into(),
            receiver: "0xmove_a".into(),
            token: "0x2::coin::USDC".into(),
            amount: "1000".into(),
            hashlock: hashlock.clone(),
            timelock: 1_800_000_000,
            counterparty_chain_id: None,
        };
        let withdrawn = ChainEvent::Withdrawn {
            meta: move_meta(0xb2),
            preimage: format!("0x{}", hex::encode([0x42; 32])),
        };
        let refunded = ChainEvent::Refunded {
            meta: move_meta(0xb2),
        };

        // The Created registers the contract; its later events resolve to
        // the same swap key.
        assert_eq!(route_for(&mut routes, &created), Some(hashlock.clone()));
        assert_eq!(route_for(&mut routes, &withdrawn), Some(hashlock.clone()));
        assert_eq!(route_for(&mut routes, &refunded), Some(hashlock));
    }

    #[test]
    fn test_route_table_misses_unknown_contracts() {
        let mut routes = RouteTable::new();
        let withdrawn = ChainEvent::Withdrawn {
            meta: move_meta(0xcf),
            preimage: format!("0x{}", hex::encode([0x42; 32])),
        };
        assert_eq!(route_for(&mut routes, &withdrawn), None);
    }

    #[test]
    fn test_amounts_match_numeric_and_literal() {
        assert!(amounts_match("1000", "1000"));
        assert!(amounts_match("01000", "1000"));
        assert!(!amounts_match("1000", "1001"));
        assert!(!amounts_match("abc", "1000"));
        assert!(amounts_match("abc", "abc"));
    }
}
