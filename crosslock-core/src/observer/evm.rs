//! EVM chain observer.
//!
//! Watches the HTLC contract's `Deposit`, `Withdraw` and `Refund` logs.
//! Polling over JSON-RPC is the backbone; a live WebSocket subscription,
//! when configured and healthy, only wakes the poll loop early. Either way
//! the observer fetches nothing past `head - confirmations`, so logs that
//! get reorganized away inside the confirmation window are never seen and
//! the cursor never has to move backwards.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use sha3::{Digest, Keccak256};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::config::{EvmConfig, MonitoringConfig};
use crate::error::RelayerError;
use crate::event::{normalize_hex, Chain, ChainEvent, EventMeta};
use crate::observer::{mark_failure, mark_success, Backoff, EventSink, SharedHealth};

pub const EVM_SOURCE: &str = "evm";
const BACKFILL_DEPTH: u64 = 10_000;
const INTER_BATCH_PAUSE: Duration = Duration::from_millis(250);

const DEPOSIT_SIGNATURE: &str =
    "Deposit(bytes32,address,address,address,uint256,bytes32,uint256,uint256)";
const WITHDRAW_SIGNATURE: &str = "Withdraw(bytes32,bytes32)";
const REFUND_SIGNATURE: &str = "Refund(bytes32)";

fn event_topic(signature: &str) -> String {
    let digest = Keccak256::digest(signature.as_bytes());
    format!("0x{}", hex::encode(digest))
}

// ---- JSON-RPC plumbing ----

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: Option<String>,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: Option<String>,
    #[serde(rename = "logIndex")]
    pub log_index: Option<String>,
    pub removed: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct EvmRpcClient {
    http: reqwest::Client,
    url: String,
}

impl EvmRpcClient {
    pub fn new(url: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            url: url.to_string(),
        }
    }

    pub async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, RelayerError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response: RpcResponse<T> = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        if let Some(err) = response.error {
            return Err(RelayerError::ChainRpc(format!(
                "{method} failed: {} (code {})",
                err.message, err.code
            )));
        }
        response
            .result
            .ok_or_else(|| RelayerError::ChainRpc(format!("{method}: empty result")))
    }

    pub async fn block_number(&self) -> Result<u64, RelayerError> {
        let hex_block: String = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&hex_block)
    }

    pub async fn get_logs(
        &self,
        address: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, RelayerError> {
        self.call(
            "eth_getLogs",
            json!([{
                "address": address,
                "fromBlock": format!("0x{from_block:x}"),
                "toBlock": format!("0x{to_block:x}"),
            }]),
        )
        .await
    }
}

pub fn parse_hex_u64(input: &str) -> Result<u64, RelayerError> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    u64::from_str_radix(stripped, 16)
        .map_err(|e| RelayerError::ChainRpc(format!("bad hex quantity {input:?}: {e}")))
}

// ---- log decoding ----

fn data_word(data: &[u8], index: usize) -> Result<[u8; 32], RelayerError> {
    let start = index * 32;
    let end = start + 32;
    if data.len() < end {
        return Err(RelayerError::InvalidInput(format!(
            "log data too short: wanted word {index}, have {} bytes",
            data.len()
        )));
    }
    let mut word = [0u8; 32];
    word.copy_from_slice(&data[start..end]);
    Ok(word)
}

fn address_from_word(word: &[u8; 32]) -> Result<String, RelayerError> {
    if word[..12].iter().any(|b| *b != 0) {
        return Err(RelayerError::InvalidInput(
            "address word has nonzero padding".into(),
        ));
    }
    Ok(format!("0x{}", hex::encode(&word[12..])))
}

fn u64_from_word(word: &[u8; 32]) -> Result<u64, RelayerError> {
    if word[..24].iter().any(|b| *b != 0) {
        return Err(RelayerError::InvalidInput("quantity exceeds u64".into()));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..]);
    Ok(u64::from_be_bytes(buf))
}

fn amount_from_word(word: &[u8; 32]) -> Result<String, RelayerError> {
    if word[..16].iter().any(|b| *b != 0) {
        return Err(RelayerError::InvalidInput("amount exceeds u128".into()));
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(buf).to_string())
}

/// Decodes one raw log into a canonical event. `None` for foreign topics.
#[derive(Clone)]
pub struct LogDecoder {
    deposit_topic: String,
    withdraw_topic: String,
    refund_topic: String,
}

impl LogDecoder {
    pub fn new() -> Self {
        Self {
            deposit_topic: event_topic(DEPOSIT_SIGNATURE),
            withdraw_topic: event_topic(WITHDRAW_SIGNATURE),
            refund_topic: event_topic(REFUND_SIGNATURE),
        }
    }

    pub fn decode(&self, log: &RawLog) -> Result<Option<ChainEvent>, RelayerError> {
        if log.removed.unwrap_or(false) {
            return Ok(None);
        }
        let topic0 = match log.topics.first() {
            Some(t) => t.to_lowercase(),
            None => return Ok(None),
        };
        let (block_number, tx_hash, log_index) =
            match (&log.block_number, &log.transaction_hash, &log.log_index) {
                (Some(block), Some(tx), Some(idx)) => {
                    (parse_hex_u64(block)?, tx.clone(), parse_hex_u64(idx)?)
                }
                // Pending log; the confirmed poll will pick it up later.
                _ => return Ok(None),
            };

        let meta = |contract_id: String| EventMeta {
            chain: Chain::Evm,
            contract_id,
            tx_hash: tx_hash.clone(),
            log_index,
            position: block_number,
            observed_at: chrono::Utc::now(),
        };

        if topic0 == self.deposit_topic {
            if log.topics.len() != 4 {
                return Err(RelayerError::InvalidInput(
                    "Deposit log with wrong topic count".into(),
                ));
            }
            let contract_id = normalize_hex(&log.topics[1], 32)?;
            let sender_word = crate::event::decode_hash32(&log.topics[2])?;
            let receiver_word = crate::event::decode_hash32(&log.topics[3])?;
            let data = hex::decode(log.data.strip_prefix("0x").unwrap_or(&log.data))
                .map_err(|e| RelayerError::InvalidInput(format!("bad log data: {e}")))?;
            let token = address_from_word(&data_word(&data, 0)?)?;
            let amount = amount_from_word(&data_word(&data, 1)?)?;
            let hashlock = format!("0x{}", hex::encode(data_word(&data, 2)?));
            let timelock = u64_from_word(&data_word(&data, 3)?)?;
            let counterparty = u64_from_word(&data_word(&data, 4)?)?;
            Ok(Some(ChainEvent::Created {
                meta: meta(contract_id),
                sender: address_from_word(&sender_word)?,
                receiver: address_from_word(&receiver_word)?,
                token,
                amount,
                hashlock,
                timelock,
                counterparty_chain_id: (counterparty != 0).then_some(counterparty),
            }))
        } else if topic0 == self.withdraw_topic {
            if log.topics.len() != 2 {
                return Err(RelayerError::InvalidInput(
                    "Withdraw log with wrong topic count".into(),
                ));
            }
            let contract_id = normalize_hex(&log.topics[1], 32)?;
            let data = hex::decode(log.data.strip_prefix("0x").unwrap_or(&log.data))
                .map_err(|e| RelayerError::InvalidInput(format!("bad log data: {e}")))?;
            let preimage = format!("0x{}", hex::encode(data_word(&data, 0)?));
            Ok(Some(ChainEvent::Withdrawn {
                meta: meta(contract_id),
                preimage,
            }))
        } else if topic0 == self.refund_topic {
            if log.topics.len() != 2 {
                return Err(RelayerError::InvalidInput(
                    "Refund log with wrong topic count".into(),
                ));
            }
            let contract_id = normalize_hex(&log.topics[1], 32)?;
            Ok(Some(ChainEvent::Refunded {
                meta: meta(contract_id),
            }))
        } else {
            Ok(None)
        }
    }
}

impl Default for LogDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ---- the observer ----

pub struct EvmObserver {
    config: EvmConfig,
    monitoring: MonitoringConfig,
    rpc: EvmRpcClient,
    decoder: LogDecoder,
    sink: EventSink,
    health: SharedHealth,
}

impl EvmObserver {
    pub fn new(
        config: EvmConfig,
        monitoring: MonitoringConfig,
        sink: EventSink,
        health: SharedHealth,
    ) -> Self {
        let rpc = EvmRpcClient::new(&config.rpc_url);
        Self {
            config,
            monitoring,
            rpc,
            decoder: LogDecoder::new(),
            sink,
            health,
        }
    }

    /// Runs until shutdown. Never returns an error; persistent RPC failure
    /// degrades health and keeps retrying with backoff.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "EVM observer starting (contract {}, confirmations {})",
            self.config.htlc_address,
            self.config.confirmations
        );

        // Push notifications only wake the poll loop early; the poll itself
        // is the single code path that fetches and records logs.
        let (hint_tx, mut hint_rx) = mpsc::channel::<()>(1);
        if let Some(push_url) = self.config.push_url.clone() {
            let address = self.config.htlc_address.clone();
            let health = self.health.clone();
            let push_shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_push_subscription(push_url, address, hint_tx, health, push_shutdown).await;
            });
        }

        // Historical sweep runs in the background; it shares the dedup index
        // with the live loop, so overlap is harmless.
        tokio::spawn(run_backfill(
            self.rpc.clone(),
            self.config.clone(),
            self.decoder.clone(),
            self.sink.clone(),
            shutdown.clone(),
        ));

        let mut backoff = Backoff::new(
            Duration::from_millis(self.monitoring.retry_delay_ms),
            Duration::from_secs(60),
        );
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.monitoring.poll_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = hint_rx.recv() => {}
                _ = shutdown.changed() => {
                    tracing::info!("EVM observer shutting down");
                    return;
                }
            }

            match self.poll_confirmed_window().await {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    mark_failure(&self.health).await;
                    let delay = backoff.next_delay();
                    tracing::warn!("EVM poll failed: {e}; backing off {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One poll cycle over `[cursor+1, head - confirmations]`, chunked by
    /// the configured batch size.
    async fn poll_confirmed_window(&self) -> Result<(), RelayerError> {
        let head = self.rpc.block_number().await?;
        let confirmed_head = head.saturating_sub(self.config.confirmations);
        let cursor = self.sink.storage.cursor_of(EVM_SOURCE).await?;
        let start = match cursor {
            Some(position) => position + 1,
            None => self.config.start_block.unwrap_or(confirmed_head),
        };

        if start > confirmed_head {
            mark_success(&self.health, cursor, head).await;
            return Ok(());
        }

        let mut from = start;
        while from <= confirmed_head {
            let to = (from + self.config.batch_size - 1).min(confirmed_head);
            let logs = self
                .rpc
                .get_logs(&self.config.htlc_address, from, to)
                .await?;
            let mut delivered = 0usize;
            for log in &logs {
                if let Some(event) = self.decoder.decode(log)? {
                    let position = event.meta().position;
                    self.sink.deliver(event, position).await?;
                    delivered += 1;
                }
            }
            self.sink.advance_empty(to).await?;
            if delivered > 0 {
                tracing::debug!("EVM window {from}..={to}: {delivered} events");
            }
            mark_success(&self.health, Some(to), head).await;
            from = to + 1;
            if from <= confirmed_head {
                tokio::time::sleep(INTER_BATCH_PAUSE).await;
            }
        }
        Ok(())
    }
}

/// One-shot historical sweep over the trailing window at startup. Runs
/// through the dedup index, so overlap with the live loop is harmless; it
/// never touches the cursor.
async fn run_backfill(
    rpc: EvmRpcClient,
    config: EvmConfig,
    decoder: LogDecoder,
    sink: EventSink,
    shutdown: watch::Receiver<bool>,
) {
    let head = match rpc.block_number().await {
        Ok(head) => head,
        Err(e) => {
            tracing::warn!("EVM backfill skipped, head unavailable: {e}");
            return;
        }
    };
    let confirmed_head = head.saturating_sub(config.confirmations);
    let mut from = confirmed_head.saturating_sub(BACKFILL_DEPTH);
    tracing::info!("EVM backfill {}..={}", from, confirmed_head);

    while from <= confirmed_head {
        if *shutdown.borrow() {
            return;
        }
        let to = (from + config.batch_size - 1).min(confirmed_head);
        match rpc.get_logs(&config.htlc_address, from, to).await {
            Ok(logs) => {
                for log in &logs {
                    match decoder.decode(log) {
                        Ok(Some(event)) => {
                            if let Err(e) = deliver_backfill(&sink, event).await {
                                tracing::warn!("EVM backfill delivery failed: {e}");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!("EVM backfill decode failed: {e}"),
                    }
                }
            }
            Err(e) => {
                tracing::warn!("EVM backfill window {from}..={to} failed: {e}");
            }
        }
        from = to + 1;
        tokio::time::sleep(INTER_BATCH_PAUSE).await;
    }
    tracing::info!("EVM backfill complete");
}

async fn deliver_backfill(sink: &EventSink, event: ChainEvent) -> Result<(), RelayerError> {
    let outcome = sink.storage.record_event(&event).await?;
    if outcome == crate::storage::RecordOutcome::Applied {
        sink.cache.set_event(&event);
        sink.bus.publish(event).await?;
    }
    Ok(())
}

/// Maintains an `eth_subscribe("logs")` stream and pokes the hint channel
/// whenever a matching log lands. Reconnects with backoff; gives up only on
/// shutdown. Polling keeps working regardless.
async fn run_push_subscription(
    push_url: String,
    address: String,
    hint_tx: mpsc::Sender<()>,
    health: SharedHealth,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(120));
    loop {
        if *shutdown.borrow() {
            return;
        }
        match subscribe_once(&push_url, &address, &hint_tx, &health, &mut shutdown).await {
            Ok(()) => return,
            Err(e) => {
                health.write().await.live_push = false;
                let delay = backoff.next_delay();
                tracing::warn!("EVM push subscription failed: {e}; retrying in {:?}", delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }
}

async fn subscribe_once(
    push_url: &str,
    address: &str,
    hint_tx: &mpsc::Sender<()>,
    health: &SharedHealth,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), RelayerError> {
    let (mut ws, _) = connect_async(push_url)
        .await
        .map_err(|e| RelayerError::ChainRpc(format!("push connect: {e}")))?;

    let subscribe = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "eth_subscribe",
        "params": ["logs", { "address": address }],
    });
    ws.send(Message::Text(subscribe.to_string()))
        .await
        .map_err(|e| RelayerError::ChainRpc(format!("push subscribe: {e}")))?;

    health.write().await.live_push = true;
    tracing::info!("EVM push subscription established");

    loop {
        tokio::select! {
            message = ws.next() => {
                match message {
                    Some(Ok(Message::Text(_))) => {
                        // Content does not matter; the poll loop re-reads the
                        // confirmed window from the durable cursor.
                        let _ = hint_tx.try_send(());
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(RelayerError::ChainRpc("push stream closed".into()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(RelayerError::ChainRpc(format!("push stream: {e}")));
                    }
                }
            }
            _ = shutdown.changed() => {
                let _ = ws.close(None).await;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pad_address(addr_byte: u8) -> String {
        let mut word = [0u8; 32];
        word[12..].fill(addr_byte);
        format!("0x{}", hex::encode(word))
    }

    fn deposit_log() -> RawLog {
        let mut data = Vec::new();
        // token
        let mut token = [0u8; 32];
        token[12..].fill(0x33);
        data.extend_from_slice(&token);
        // amount = 1000
        let mut amount = [0u8; 32];
        amount[30] = 0x03;
        amount[31] = 0xe8;
        data.extend_from_slice(&amount);
        // hashlock
        data.extend_from_slice(&[0x77; 32]);
        // timelock = 1800000000
        let mut timelock = [0u8; 32];
        timelock[24..].copy_from_slice(&1_800_000_000u64.to_be_bytes());
        data.extend_from_slice(&timelock);
        // counterparty chain id = 0 (absent)
        data.extend_from_slice(&[0u8; 32]);

        RawLog {
            address: "0x00000000000000000000000000000000000000aa".into(),
            topics: vec![
                event_topic(DEPOSIT_SIGNATURE),
                format!("0x{}", hex::encode([0xaa; 32])),
                pad_address(0x55),
                pad_address(0x66),
            ],
            data: format!("0x{}", hex::encode(data)),
            block_number: Some("0x64".into()),
            transaction_hash: Some(format!("0x{}", hex::encode([0x11; 32]))),
            log_index: Some("0x2".into()),
            removed: Some(false),
        }
    }

    #[test]
    fn test_decode_deposit() {
        let decoder = LogDecoder::new();
        let event = decoder.decode(&deposit_log()).unwrap().unwrap();
        match event {
            ChainEvent::Created {
                meta,
                sender,
                receiver,
                token,
                amount,
                hashlock,
                timelock,
                counterparty_chain_id,
            } => {
                assert_eq!(meta.chain, Chain::Evm);
                assert_eq!(meta.position, 100);
                assert_eq!(meta.log_index, 2);
                assert_eq!(meta.contract_id, format!("0x{}", hex::encode([0xaa; 32])));
                assert_eq!(sender, format!("0x{}", hex::encode([0x55; 20])));
                assert_eq!(receiver, format!("0x{}", hex::encode([0x66; 20])));
                assert_eq!(token, format!("0x{}", hex::encode([0x33; 20])));
                assert_eq!(amount, "1000");
                assert_eq!(hashlock, format!("0x{}", hex::encode([0x77; 32])));
                assert_eq!(timelock, 1_800_000_000);
                assert_eq!(counterparty_chain_id, None);
            }
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_withdraw() {
        let decoder = LogDecoder::new();
        let log = RawLog {
            address: "0x00000000000000000000000000000000000000aa".into(),
            topics: vec![
                event_topic(WITHDRAW_SIGNATURE),
                format!("0x{}", hex::encode([0xaa; 32])),
            ],
            data: format!("0x{}", hex::encode([0x42; 32])),
            block_number: Some("0x65".into()),
            transaction_hash: Some(format!("0x{}", hex::encode([0x12; 32]))),
            log_index: Some("0x0".into()),
            removed: None,
        };
        let event = decoder.decode(&log).unwrap().unwrap();
        match event {
            ChainEvent::Withdrawn { preimage, .. } => {
                assert_eq!(preimage, format!("0x{}", hex::encode([0x42; 32])));
            }
            other => panic!("expected Withdrawn, got {other:?}"),
        }
    }

    #[test]
    fn test_foreign_topic_is_skipped() {
        let decoder = LogDecoder::new();
        let mut log = deposit_log();
        log.topics[0] = format!("0x{}", hex::encode([0xff; 32]));
        assert!(decoder.decode(&log).unwrap().is_none());
    }

    #[test]
    fn test_removed_log_is_skipped() {
        let decoder = LogDecoder::new();
        let mut log = deposit_log();
        log.removed = Some(true);
        assert!(decoder.decode(&log).unwrap().is_none());
    }

    #[test]
    fn test_pending_log_is_skipped() {
        let decoder = LogDecoder::new();
        let mut log = deposit_log();
        log.block_number = None;
        assert!(decoder.decode(&log).unwrap().is_none());
    }

    #[test]
    fn test_truncated_data_is_an_error() {
        let decoder = LogDecoder::new();
        let mut log = deposit_log();
        log.data = format!("0x{}", hex::encode([0u8; 64]));
        assert!(decoder.decode(&log).is_err());
    }

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(parse_hex_u64("0x0").unwrap(), 0);
        assert_eq!(parse_hex_u64("0xff").unwrap(), 255);
        assert!(parse_hex_u64("0xzz").is_err());
    }
}
