//! Swap sessions and the status transition policy.
//!
//! A [`SwapSession`] is the root entity: one per atomic cross-chain swap,
//! correlated by hashlock. Status changes are validated by
//! [`SwapStatus::can_transition_to`] before any write; the repository rejects
//! everything else.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RelayerError;
use crate::event::{decode_hash32, Chain};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapStatus {
    Pending,
    SourceLocked,
    BothLocked,
    PreimageRevealed,
    Completed,
    Refunded,
    Failed,
}

impl SwapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Pending => "PENDING",
            SwapStatus::SourceLocked => "SOURCE_LOCKED",
            SwapStatus::BothLocked => "BOTH_LOCKED",
            SwapStatus::PreimageRevealed => "PREIMAGE_REVEALED",
            SwapStatus::Completed => "COMPLETED",
            SwapStatus::Refunded => "REFUNDED",
            SwapStatus::Failed => "FAILED",
        }
    }

    /// Terminal states are absorbing: once entered, only `error_messages`
    /// may still change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapStatus::Completed | SwapStatus::Refunded | SwapStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: SwapStatus) -> bool {
        use SwapStatus::*;
        match self {
            Pending => matches!(next, SourceLocked | Failed | Refunded),
            SourceLocked => matches!(next, BothLocked | Refunded | Failed),
            BothLocked => matches!(next, PreimageRevealed | Refunded | Failed),
            PreimageRevealed => matches!(next, Completed | Failed),
            Completed | Refunded | Failed => false,
        }
    }
}

impl std::fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SwapStatus {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SwapStatus::Pending),
            "SOURCE_LOCKED" => Ok(SwapStatus::SourceLocked),
            "BOTH_LOCKED" => Ok(SwapStatus::BothLocked),
            "PREIMAGE_REVEALED" => Ok(SwapStatus::PreimageRevealed),
            "COMPLETED" => Ok(SwapStatus::Completed),
            "REFUNDED" => Ok(SwapStatus::Refunded),
            "FAILED" => Ok(SwapStatus::Failed),
            other => Err(RelayerError::InvalidInput(format!(
                "unknown swap status: {other}"
            ))),
        }
    }
}

/// One atomic cross-chain swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapSession {
    /// 16-hex-char digest of `source_contract_id || hashlock`; stable across
    /// restarts.
    pub swap_id: String,
    pub status: SwapStatus,
    /// Chain on which the first HTLC was observed.
    pub source_chain: Chain,
    pub initiator: String,
    pub receiver: String,
    pub evm_contract_id: Option<String>,
    pub move_contract_id: Option<String>,
    /// 32-byte SHA-256 commitment, 0x-prefixed hex.
    pub hashlock: String,
    /// Revealed lazily by an HTLC_WITHDRAWN event.
    pub preimage: Option<String>,
    /// Decimal string.
    pub amount: String,
    pub token_source: String,
    pub token_target: String,
    /// Absolute deadline, unix seconds.
    pub timelock: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_messages: Vec<String>,
    pub source_tx_hash: String,
    pub target_tx_hash: Option<String>,
    pub refund_tx_hash: Option<String>,
}

/// Derives the swap identifier from the originating contract id and the
/// hashlock: the first 8 bytes of `SHA-256(contract_id || hashlock)`, hex.
pub fn derive_swap_id(source_contract_id: &str, hashlock: &str) -> Result<String, RelayerError> {
    let contract = decode_hash32(source_contract_id)?;
    let lock = decode_hash32(hashlock)?;
    let mut hasher = Sha256::new();
    hasher.update(contract);
    hasher.update(lock);
    let digest = hasher.finalize();
    Ok(hex::encode(&digest[..8]))
}

/// Checks a revealed preimage against a hashlock commitment.
pub fn verify_preimage(preimage: &str, hashlock: &str) -> Result<bool, RelayerError> {
    let preimage_bytes = decode_hash32(preimage)?;
    let expected = decode_hash32(hashlock)?;
    let digest: [u8; 32] = Sha256::digest(preimage_bytes).into();
    Ok(digest == expected)
}

impl SwapSession {
    pub fn contract_id_on(&self, chain: Chain) -> Option<&str> {
        match chain {
            Chain::Evm => self.evm_contract_id.as_deref(),
            Chain::Move => self.move_contract_id.as_deref(),
        }
    }

    pub fn set_contract_id(&mut self, chain: Chain, contract_id: String) {
        match chain {
            Chain::Evm => self.evm_contract_id = Some(contract_id),
            Chain::Move => self.move_contract_id = Some(contract_id),
        }
    }

    pub fn both_sides_locked(&self) -> bool {
        self.evm_contract_id.is_some() && self.move_contract_id.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.expires_at <= now
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        self.error_messages.push(message.into());
    }

    /// Applies a status change, enforcing the transition table and the
    /// monotonic `updated_at` invariant.
    pub fn transition(&mut self, next: SwapStatus) -> Result<(), RelayerError> {
        if !self.status.can_transition_to(next) {
            return Err(RelayerError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// Builder for a session from the first observed HTLC_CREATED event.
pub struct NewSwap<'a> {
    pub source_chain: Chain,
    pub source_contract_id: &'a str,
    pub hashlock: &'a str,
    pub initiator: &'a str,
    pub receiver: &'a str,
    pub token: &'a str,
    pub amount: &'a str,
    pub timelock: u64,
    pub source_tx_hash: &'a str,
}

impl NewSwap<'_> {
    pub fn build(self) -> Result<SwapSession, RelayerError> {
        let swap_id = derive_swap_id(self.source_contract_id, self.hashlock)?;
        let now = Utc::now();
        let expires_at = Utc
            .timestamp_opt(self.timelock as i64, 0)
            .single()
            .ok_or_else(|| {
                RelayerError::InvalidTimelock(format!("unrepresentable timelock {}", self.timelock))
            })?;

        let mut swap = SwapSession {
            swap_id,
            status: SwapStatus::Pending,
            source_chain: self.source_chain,
            initiator: self.initiator.to_string(),
            receiver: self.receiver.to_string(),
            evm_contract_id: None,
            move_contract_id: None,
            hashlock: self.hashlock.to_string(),
            preimage: None,
            amount: self.amount.to_string(),
            token_source: self.token.to_string(),
            token_target: String::new(),
            timelock: self.timelock,
            created_at: now,
            updated_at: now,
            expires_at,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error_messages: Vec::new(),
            source_tx_hash: self.source_tx_hash.to_string(),
            target_tx_hash: None,
            refund_tx_hash: None,
        };
        swap.set_contract_id(self.source_chain, self.source_contract_id.to_string());
        Ok(swap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Digest;

    fn hex32(byte: u8) -> String {
        format!("0x{}", hex::encode([byte; 32]))
    }

    fn sample_swap() -> SwapSession {
        NewSwap {
            source_chain: Chain::Evm,
            source_contract_id: &hex32(0xaa),
            hashlock: &hex32(0x77),
            initiator: "0x5555555555555555555555555555555555555555",
            receiver: "0x6666666666666666666666666666666666666666",
            token: "0x0000000000000000000000000000000000000000",
            amount: "1000",
            timelock: (Utc::now().timestamp() + 3600) as u64,
            source_tx_hash: &hex32(0x11),
        }
        .build()
        .unwrap()
    }

    #[test]
    fn test_swap_id_is_stable_and_16_chars() {
        let a = derive_swap_id(&hex32(0xaa), &hex32(0xbb)).unwrap();
        let b = derive_swap_id(&hex32(0xaa), &hex32(0xbb)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        // A different hashlock yields a different id.
        let c = derive_swap_id(&hex32(0xaa), &hex32(0xbc)).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_preimage_verification() {
        let preimage = [0x42u8; 32];
        let hashlock: [u8; 32] = sha2::Sha256::digest(preimage).into();
        let preimage_hex = format!("0x{}", hex::encode(preimage));
        let hashlock_hex = format!("0x{}", hex::encode(hashlock));
        assert!(verify_preimage(&preimage_hex, &hashlock_hex).unwrap());

        let wrong = format!("0x{}", hex::encode([0x43u8; 32]));
        assert!(!verify_preimage(&wrong, &hashlock_hex).unwrap());
    }

    #[test]
    fn test_transition_table() {
        use SwapStatus::*;
        assert!(Pending.can_transition_to(SourceLocked));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(BothLocked));
        assert!(SourceLocked.can_transition_to(BothLocked));
        assert!(!SourceLocked.can_transition_to(PreimageRevealed));
        assert!(BothLocked.can_transition_to(PreimageRevealed));
        assert!(PreimageRevealed.can_transition_to(Completed));
        assert!(!PreimageRevealed.can_transition_to(Refunded));
        for terminal in [Completed, Refunded, Failed] {
            for next in [
                Pending,
                SourceLocked,
                BothLocked,
                PreimageRevealed,
                Completed,
                Refunded,
                Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_transition_rejects_and_preserves_state() {
        let mut swap = sample_swap();
        swap.transition(SwapStatus::SourceLocked).unwrap();
        let before = swap.updated_at;
        let err = swap.transition(SwapStatus::Completed).unwrap_err();
        assert!(matches!(err, RelayerError::InvalidTransition { .. }));
        assert_eq!(swap.status, SwapStatus::SourceLocked);
        assert_eq!(swap.updated_at, before);
    }

    #[test]
    fn test_updated_at_monotonic() {
        let mut swap = sample_swap();
        let created = swap.created_at;
        swap.transition(SwapStatus::SourceLocked).unwrap();
        assert!(swap.updated_at >= created);
    }

    #[test]
    fn test_both_sides_locked() {
        let mut swap = sample_swap();
        assert!(!swap.both_sides_locked());
        swap.set_contract_id(Chain::Move, hex32(0xbb));
        assert!(swap.both_sides_locked());
        assert_eq!(swap.contract_id_on(Chain::Evm).unwrap(), hex32(0xaa));
    }
}
