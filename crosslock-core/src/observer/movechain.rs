//! Move chain observer.
//!
//! Checkpoint-paged polling against the HTLC package's event stream. The
//! node's query endpoint is authoritative per checkpoint, so the cursor is a
//! checkpoint sequence number and a window is only swept once the node has
//! sealed it.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;

use crate::config::{MonitoringConfig, MoveConfig};
use crate::error::RelayerError;
use crate::event::{normalize_hex, Chain, ChainEvent, EventMeta};
use crate::observer::{mark_failure, mark_success, Backoff, EventSink, SharedHealth};

pub const MOVE_SOURCE: &str = "move";
const INTER_BATCH_PAUSE: Duration = Duration::from_millis(250);

const CREATED_SUFFIX: &str = "::htlc::HTLCCreated";
const WITHDRAWN_SUFFIX: &str = "::htlc::HTLCWithdrawn";
const REFUNDED_SUFFIX: &str = "::htlc::HTLCRefunded";

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
pub struct MoveRawEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "txDigest")]
    pub tx_digest: String,
    #[serde(rename = "eventSeq")]
    pub event_seq: u64,
    pub checkpoint: u64,
    pub fields: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct EventPage {
    data: Vec<MoveRawEvent>,
}

#[derive(Debug, Clone)]
pub struct MoveRpcClient {
    http: reqwest::Client,
    url: String,
}

impl MoveRpcClient {
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

    pub async fn latest_checkpoint(&self) -> Result<u64, RelayerError> {
        self.call("move_getLatestCheckpoint", json!([])).await
    }

    pub async fn query_events(
        &self,
        package_id: &str,
        from_checkpoint: u64,
        to_checkpoint: u64,
    ) -> Result<Vec<MoveRawEvent>, RelayerError> {
        let page: EventPage = self
            .call(
                "move_queryEvents",
                json!([package_id, from_checkpoint, to_checkpoint]),
            )
            .await?;
        Ok(page.data)
    }
}

// ---- payload translation ----

fn field_str<'a>(fields: &'a serde_json::Value, key: &str) -> Result<&'a str, RelayerError> {
    fields
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| RelayerError::InvalidInput(format!("Move event missing field {key:?}")))
}

/// Move nodes serialize u64 either as a JSON number or a decimal string.
fn field_u64(fields: &serde_json::Value, key: &str) -> Result<u64, RelayerError> {
    match fields.get(key) {
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| RelayerError::InvalidInput(format!("field {key:?} out of range"))),
        Some(serde_json::Value::String(s)) => s
            .parse()
            .map_err(|e| RelayerError::InvalidInput(format!("field {key:?}: {e}"))),
        _ => Err(RelayerError::InvalidInput(format!(
            "Move event missing field {key:?}"
        ))),
    }
}

/// Translates one raw Move event into canonical form. `None` for event
/// types outside the HTLC module.
pub fn translate_event(raw: &MoveRawEvent) -> Result<Option<ChainEvent>, RelayerError> {
    let meta = |contract_id: String| EventMeta {
        chain: Chain::Move,
        contract_id,
        tx_hash: raw.tx_digest.clone(),
        log_index: raw.event_seq,
        position: raw.checkpoint,
        observed_at: chrono::Utc::now(),
    };

    if raw.event_type.ends_with(CREATED_SUFFIX) {
        let contract_id = normalize_hex(field_str(&raw.fields, "contract_id")?, 32)?;
        let amount_raw = field_u64(&raw.fields, "amount")?;
        Ok(Some(ChainEvent::Created {
            meta: meta(contract_id),
            sender: field_str(&raw.fields, "sender")?.to_string(),
            receiver: field_str(&raw.fields, "receiver")?.to_string(),
            token: field_str(&raw.fields, "token")?.to_string(),
            amount: amount_raw.to_string(),
            hashlock: normalize_hex(field_str(&raw.fields, "hashlock")?, 32)?,
            timelock: field_u64(&raw.fields, "timelock")?,
            counterparty_chain_id: field_u64(&raw.fields, "counterparty_chain_id").ok(),
        }))
    } else if raw.event_type.ends_with(WITHDRAWN_SUFFIX) {
        let contract_id = normalize_hex(field_str(&raw.fields, "contract_id")?, 32)?;
        Ok(Some(ChainEvent::Withdrawn {
            meta: meta(contract_id),
            preimage: normalize_hex(field_str(&raw.fields, "preimage")?, 32)?,
        }))
    } else if raw.event_type.ends_with(REFUNDED_SUFFIX) {
        let contract_id = normalize_hex(field_str(&raw.fields, "contract_id")?, 32)?;
        Ok(Some(ChainEvent::Refunded {
            meta: meta(contract_id),
        }))
    } else {
        Ok(None)
    }
}

// ---- the observer ----

pub struct MoveObserver {
    config: MoveConfig,
    monitoring: MonitoringConfig,
    rpc: MoveRpcClient,
    sink: EventSink,
    health: SharedHealth,
}

impl MoveObserver {
    pub fn new(
        config: MoveConfig,
        monitoring: MonitoringConfig,
        sink: EventSink,
        health: SharedHealth,
    ) -> Self {
        let rpc = MoveRpcClient::new(&config.rpc_url);
        Self {
            config,
            monitoring,
            rpc,
            sink,
            health,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Move observer starting (package {}, network {:?})",
            self.config.package_id,
            self.config.network
        );

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
                _ = shutdown.changed() => {
                    tracing::info!("Move observer shutting down");
                    return;
                }
            }

            match self.poll_window().await {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    mark_failure(&self.health).await;
                    let delay = backoff.next_delay();
                    tracing::warn!("Move poll failed: {e}; backing off {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn poll_window(&self) -> Result<(), RelayerError> {
        let latest = self.rpc.latest_checkpoint().await?;
        let cursor = self.sink.storage.cursor_of(MOVE_SOURCE).await?;
        let start = match cursor {
            Some(position) => position + 1,
            None => self.config.start_checkpoint.unwrap_or(latest),
        };

        if start > latest {
            mark_success(&self.health, cursor, latest).await;
            return Ok(());
        }

        let mut from = start;
        while from <= latest {
            let to = (from + self.config.batch_size - 1).min(latest);
            let events = self
                .rpc
                .query_events(&self.config.package_id, from, to)
                .await?;
            let mut delivered = 0usize;
            for raw in &events {
                if let Some(event) = translate_event(raw)? {
                    let position = event.meta().position;
                    self.sink.deliver(event, position).await?;
                    delivered += 1;
                }
            }
            self.sink.advance_empty(to).await?;
            if delivered > 0 {
                tracing::debug!("Move checkpoints {from}..={to}: {delivered} events");
            }
            mark_success(&self.health, Some(to), latest).await;
            from = to + 1;
            if from <= latest {
                tokio::time::sleep(INTER_BATCH_PAUSE).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_created() -> MoveRawEvent {
        MoveRawEvent {
            event_type: "0xdead::htlc::HTLCCreated".into(),
            tx_digest: "9Yw1".into(),
            event_seq: 1,
            checkpoint: 4242,
            fields: json!({
                "contract_id": format!("0x{}", hex::encode([0xbb; 32])),
                "sender": "0xmove_sender",
                "receiver": "0xmove_receiver",
                "token": "0x2::coin::USDC",
                "amount": "1000",
                "hashlock": format!("0x{}", hex::encode([0x77; 32])),
                "timelock": 1_800_000_000u64,
            }),
        }
    }

    #[test]
    fn test_translate_created() {
        let event = translate_event(&raw_created()).unwrap().unwrap();
        match event {
            ChainEvent::Created {
                meta,
                amount,
                hashlock,
                timelock,
                counterparty_chain_id,
                ..
            } => {
                assert_eq!(meta.chain, Chain::Move);
                assert_eq!(meta.position, 4242);
                assert_eq!(meta.log_index, 1);
                assert_eq!(amount, "1000");
                assert_eq!(hashlock, format!("0x{}", hex::encode([0x77; 32])));
                assert_eq!(timelock, 1_800_000_000);
                assert_eq!(counterparty_chain_id, None);
            }
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[test]
    fn test_translate_withdrawn() {
        let raw = MoveRawEvent {
            event_type: "0xdead::htlc::HTLCWithdrawn".into(),
            tx_digest: "9Yw2".into(),
            event_seq: 0,
            checkpoint: 4243,
            fields: json!({
                "contract_id": format!("0x{}", hex::encode([0xbb; 32])),
                "preimage": format!("0x{}", hex::encode([0x42; 32])),
            }),
        };
        let event = translate_event(&raw).unwrap().unwrap();
        match event {
            ChainEvent::Withdrawn { preimage, .. } => {
                assert_eq!(preimage, format!("0x{}", hex::encode([0x42; 32])));
            }
            other => panic!("expected Withdrawn, got {other:?}"),
        }
    }

    #[test]
    fn test_unrelated_event_is_skipped() {
        let mut raw = raw_created();
        raw.event_type = "0xdead::marketplace::Listed".into();
        assert!(translate_event(&raw).unwrap().is_none());
    }

    #[test]
    fn test_missing_field_is_an_error() {
        let mut raw = raw_created();
        raw.fields.as_object_mut().unwrap().remove("hashlock");
        assert!(translate_event(&raw).is_err());
    }

    #[test]
    fn test_timelock_accepts_number_and_string() {
        let mut raw = raw_created();
        raw.fields["timelock"] = json!("1800000000");
        let event = translate_event(&raw).unwrap().unwrap();
        match event {
            ChainEvent::Created { timelock, .. } => assert_eq!(timelock, 1_800_000_000),
            _ => unreachable!(),
        }
    }
}
