//! Normalized chain events.
//!
//! Both observers translate their raw chain payloads into [`ChainEvent`]
//! before anything downstream sees them; the coordinator never touches a raw
//! log or a raw Move event. Field validation happens at the observer
//! boundary, so a constructed `ChainEvent` is always well formed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Evm,
    Move,
}

impl Chain {
    pub fn other(&self) -> Chain {
        match self {
            Chain::Evm => Chain::Move,
            Chain::Move => Chain::Evm,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Evm => "evm",
            Chain::Move => "move",
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Chain {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "evm" => Ok(Chain::Evm),
            "move" => Ok(Chain::Move),
            other => Err(RelayerError::InvalidInput(format!(
                "unknown chain: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Withdrawn,
    Refunded,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "HTLC_CREATED",
            EventKind::Withdrawn => "HTLC_WITHDRAWN",
            EventKind::Refunded => "HTLC_REFUNDED",
        }
    }
}

/// Provenance shared by every event variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    pub chain: Chain,
    /// 32-byte contract id, 0x-prefixed hex.
    pub contract_id: String,
    pub tx_hash: String,
    pub log_index: u64,
    /// Block number on EVM, checkpoint sequence on Move.
    pub position: u64,
    pub observed_at: DateTime<Utc>,
}

/// An HTLC lifecycle event in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChainEvent {
    #[serde(rename = "HTLC_CREATED")]
    Created {
        meta: EventMeta,
        sender: String,
        receiver: String,
        token: String,
        /// Decimal string; never parsed into floats.
        amount: String,
        /// 32-byte SHA-256 commitment, 0x-prefixed hex.
        hashlock: String,
        /// Unix seconds.
        timelock: u64,
        counterparty_chain_id: Option<u64>,
    },
    #[serde(rename = "HTLC_WITHDRAWN")]
    Withdrawn {
        meta: EventMeta,
        /// 32-byte revealed preimage, 0x-prefixed hex.
        preimage: String,
    },
    #[serde(rename = "HTLC_REFUNDED")]
    Refunded { meta: EventMeta },
}

impl ChainEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            ChainEvent::Created { meta, .. } => meta,
            ChainEvent::Withdrawn { meta, .. } => meta,
            ChainEvent::Refunded { meta } => meta,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ChainEvent::Created { .. } => EventKind::Created,
            ChainEvent::Withdrawn { .. } => EventKind::Withdrawn,
            ChainEvent::Refunded { .. } => EventKind::Refunded,
        }
    }

    /// Natural key used for exactly-once processing. Two deliveries of the
    /// same on-chain occurrence always produce the same key.
    pub fn idempotency_key(&self) -> String {
        let meta = self.meta();
        format!(
            "{}:{}:{}:{}:{}",
            meta.chain,
            meta.contract_id,
            self.kind().as_str(),
            meta.tx_hash,
            meta.log_index
        )
    }
}

/// Lowercases and 0x-prefixes a hex string, validating the expected byte
/// length. All hashes, addresses, and ids pass through here at the observer
/// boundary.
pub fn normalize_hex(input: &str, expected_bytes: usize) -> Result<String, RelayerError> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    let bytes = hex::decode(stripped)
        .map_err(|e| RelayerError::InvalidInput(format!("bad hex {input:?}: {e}")))?;
    if bytes.len() != expected_bytes {
        return Err(RelayerError::InvalidInput(format!(
            "expected {expected_bytes} bytes, got {} in {input:?}",
            bytes.len()
        )));
    }
    Ok(format!("0x{}", hex::encode(bytes)))
}

/// Decodes a 0x-prefixed hex string into a fixed 32-byte array.
pub fn decode_hash32(input: &str) -> Result<[u8; 32], RelayerError> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    let bytes = hex::decode(stripped)
        .map_err(|e| RelayerError::InvalidInput(format!("bad hex {input:?}: {e}")))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| RelayerError::InvalidInput(format!("{input:?} is not 32 bytes")))?;
    Ok(arr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(chain: Chain) -> EventMeta {
        EventMeta {
            chain,
            contract_id: format!("0x{}", hex::encode([0xaa; 32])),
            tx_hash: format!("0x{}", hex::encode([0x11; 32])),
            log_index: 3,
            position: 100,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_idempotency_key_is_stable_across_observed_at() {
        let mut a = meta(Chain::Evm);
        let mut b = meta(Chain::Evm);
        a.observed_at = Utc::now();
        b.observed_at = a.observed_at + chrono::Duration::seconds(5);
        let ev_a = ChainEvent::Refunded { meta: a };
        let ev_b = ChainEvent::Refunded { meta: b };
        assert_eq!(ev_a.idempotency_key(), ev_b.idempotency_key());
    }

    #[test]
    fn test_idempotency_key_distinguishes_kinds() {
        let withdrawn = ChainEvent::Withdrawn {
            meta: meta(Chain::Move),
            preimage: format!("0x{}", hex::encode([0x22; 32])),
        };
        let refunded = ChainEvent::Refunded {
            meta: meta(Chain::Move),
        };
        assert_ne!(withdrawn.idempotency_key(), refunded.idempotency_key());
    }

    #[test]
    fn test_normalize_hex_handles_prefix_and_case() {
        let raw = "0xAABBCCDDEEFF00112233445566778899AABBCCDDEEFF00112233445566778899";
        let normalized = normalize_hex(raw, 32).unwrap();
        assert_eq!(
            normalized,
            "0xaabbccddeeff00112233445566778899aabbccddeeff00112233445566778899"
        );
        assert_eq!(normalize_hex(&normalized[2..], 32).unwrap(), normalized);
    }

    #[test]
    fn test_normalize_hex_rejects_wrong_length() {
        assert!(normalize_hex("0xaabb", 32).is_err());
        assert!(normalize_hex("0xzz", 1).is_err());
    }

    #[test]
    fn test_event_serde_round_trip_keeps_tag() {
        let ev = ChainEvent::Withdrawn {
            meta: meta(Chain::Move),
            preimage: format!("0x{}", hex::encode([0x42; 32])),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "HTLC_WITHDRAWN");
        let back: ChainEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }
}
