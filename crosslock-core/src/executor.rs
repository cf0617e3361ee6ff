//! Withdrawal executor.
//!
//! Builds, signs and submits withdrawal/refund transactions on behalf of the
//! coordinator. The coordinator only sees `withdraw`/`refund` returning a tx
//! hash or a classified error; everything chain-specific stays here. EVM
//! calls are submitted through the node-managed relayer account; Move calls
//! are built by the node and signed locally with the relayer's ed25519 key.

use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::json;
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::config::{EvmConfig, MoveConfig};
use crate::error::RelayerError;
use crate::event::{decode_hash32, Chain};
use crate::observer::evm::{parse_hex_u64, EvmRpcClient};
use crate::observer::movechain::MoveRpcClient;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const RECEIPT_POLL_ATTEMPTS: u32 = 60;

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Worth retrying: nonce race, RPC timeout, transport hiccup.
    #[error("transient execution failure: {0}")]
    Transient(String),
    /// The contract reports the action already happened; the coordinator
    /// reconciles instead of retrying.
    #[error("already settled on-chain: {0}")]
    AlreadySettled(String),
    /// Reverted or rejected for good; retrying cannot help.
    #[error("permanent execution failure: {0}")]
    Permanent(String),
}

impl ExecutionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Transient(_))
    }

    fn from_rpc(err: RelayerError) -> Self {
        let text = err.to_string();
        let lowered = text.to_lowercase();
        if lowered.contains("already withdrawn")
            || lowered.contains("already refunded")
            || lowered.contains("already settled")
        {
            ExecutionError::AlreadySettled(text)
        } else if lowered.contains("revert") || lowered.contains("invalid") {
            ExecutionError::Permanent(text)
        } else {
            ExecutionError::Transient(text)
        }
    }
}

/// Chain-agnostic seam the coordinator calls through.
#[async_trait]
pub trait WithdrawalExecutor: Send + Sync {
    async fn withdraw(
        &self,
        chain: Chain,
        contract_id: &str,
        preimage: &str,
    ) -> Result<String, ExecutionError>;

    async fn refund(&self, chain: Chain, contract_id: &str) -> Result<String, ExecutionError>;
}

// ---- EVM ----

fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// `withdraw(bytes32 contractId, bytes32 preimage)` calldata.
pub fn withdraw_calldata(contract_id: &str, preimage: &str) -> Result<String, RelayerError> {
    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&selector("withdraw(bytes32,bytes32)"));
    data.extend_from_slice(&decode_hash32(contract_id)?);
    data.extend_from_slice(&decode_hash32(preimage)?);
    Ok(format!("0x{}", hex::encode(data)))
}

/// `refund(bytes32 contractId)` calldata.
pub fn refund_calldata(contract_id: &str) -> Result<String, RelayerError> {
    let mut data = Vec::with_capacity(4 + 32);
    data.extend_from_slice(&selector("refund(bytes32)"));
    data.extend_from_slice(&decode_hash32(contract_id)?);
    Ok(format!("0x{}", hex::encode(data)))
}

pub struct EvmExecutor {
    config: EvmConfig,
    rpc: EvmRpcClient,
}

impl EvmExecutor {
    pub fn new(config: EvmConfig) -> Self {
        let rpc = EvmRpcClient::new(&config.rpc_url);
        Self { config, rpc }
    }

    async fn submit(&self, calldata: String) -> Result<String, ExecutionError> {
        let tx_hash: String = self
            .rpc
            .call(
                "eth_sendTransaction",
                json!([{
                    "from": self.config.relayer_address,
                    "to": self.config.htlc_address,
                    "data": calldata,
                }]),
            )
            .await
            .map_err(ExecutionError::from_rpc)?;

        self.wait_confirmed(&tx_hash).await?;
        Ok(tx_hash)
    }

    /// Polls for the receipt, then for the confirmation window to pass.
    async fn wait_confirmed(&self, tx_hash: &str) -> Result<(), ExecutionError> {
        let mut receipt_block = None;
        for _ in 0..RECEIPT_POLL_ATTEMPTS {
            let receipt: Option<serde_json::Value> = self
                .rpc
                .call("eth_getTransactionReceipt", json!([tx_hash]))
                .await
                .ok()
                .flatten();
            if let Some(receipt) = receipt {
                let status = receipt.get("status").and_then(|s| s.as_str()).unwrap_or("");
                if status == "0x0" {
                    return Err(ExecutionError::Permanent(format!(
                        "transaction {tx_hash} reverted"
                    )));
                }
                receipt_block = receipt
                    .get("blockNumber")
                    .and_then(|b| b.as_str())
                    .and_then(|b| parse_hex_u64(b).ok());
                break;
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
        let mined_at = receipt_block.ok_or_else(|| {
            ExecutionError::Transient(format!("no receipt for {tx_hash} yet"))
        })?;

        for _ in 0..RECEIPT_POLL_ATTEMPTS {
            let head = self
                .rpc
                .block_number()
                .await
                .map_err(ExecutionError::from_rpc)?;
            if head >= mined_at + self.config.confirmations {
                return Ok(());
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
        Err(ExecutionError::Transient(format!(
            "transaction {tx_hash} not confirmed in time"
        )))
    }
}

// ---- Move ----

pub struct MoveExecutor {
    config: MoveConfig,
    rpc: MoveRpcClient,
    signer: SigningKey,
}

impl MoveExecutor {
    pub fn new(config: MoveConfig) -> Result<Self, RelayerError> {
        let key_bytes = decode_hash32(&config.signer_key)?;
        let signer = SigningKey::from_bytes(&key_bytes);
        let rpc = MoveRpcClient::new(&config.rpc_url);
        Ok(Self {
            config,
            rpc,
            signer,
        })
    }

    async fn submit(
        &self,
        function: &str,
        args: serde_json::Value,
    ) -> Result<String, ExecutionError> {
        let built: serde_json::Value = self
            .rpc
            .call(
                "move_buildTransaction",
                json!([
                    self.config.sender_address,
                    self.config.package_id,
                    "htlc",
                    function,
                    args,
                ]),
            )
            .await
            .map_err(ExecutionError::from_rpc)?;
        let tx_bytes_hex = built
            .get("tx_bytes")
            .and_then(|b| b.as_str())
            .ok_or_else(|| ExecutionError::Permanent("build returned no tx_bytes".into()))?;
        let tx_bytes = hex::decode(tx_bytes_hex.strip_prefix("0x").unwrap_or(tx_bytes_hex))
            .map_err(|e| ExecutionError::Permanent(format!("bad tx_bytes: {e}")))?;

        let signature = self.signer.sign(&tx_bytes);
        let public_key = self.signer.verifying_key();

        let result: serde_json::Value = self
            .rpc
            .call(
                "move_executeTransaction",
                json!([
                    tx_bytes_hex,
                    format!("0x{}", hex::encode(signature.to_bytes())),
                    format!("0x{}", hex::encode(public_key.to_bytes())),
                ]),
            )
            .await
            .map_err(ExecutionError::from_rpc)?;

        let status = result.get("status").and_then(|s| s.as_str()).unwrap_or("");
        let digest = result
            .get("digest")
            .and_then(|d| d.as_str())
            .unwrap_or_default()
            .to_string();
        if status != "success" {
            let detail = result
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown")
                .to_string();
            return Err(ExecutionError::from_rpc(RelayerError::ChainRpc(format!(
                "move {function} failed: {detail}"
            ))));
        }
        Ok(digest)
    }
}

/// Routes executor calls to the right chain backend.
pub struct ChainExecutors {
    evm: EvmExecutor,
    move_chain: MoveExecutor,
}

impl ChainExecutors {
    pub fn new(evm_config: EvmConfig, move_config: MoveConfig) -> Result<Self, RelayerError> {
        Ok(Self {
            evm: EvmExecutor::new(evm_config),
            move_chain: MoveExecutor::new(move_config)?,
        })
    }
}

#[async_trait]
impl WithdrawalExecutor for ChainExecutors {
    async fn withdraw(
        &self,
        chain: Chain,
        contract_id: &str,
        preimage: &str,
    ) -> Result<String, ExecutionError> {
        tracing::info!("submitting withdrawal on {chain} for contract {contract_id}");
        match chain {
            Chain::Evm => {
                let calldata = withdraw_calldata(contract_id, preimage)
                    .map_err(|e| ExecutionError::Permanent(e.to_string()))?;
                self.evm.submit(calldata).await
            }
            Chain::Move => {
                self.move_chain
                    .submit("withdraw", json!([contract_id, preimage]))
                    .await
            }
        }
    }

    async fn refund(&self, chain: Chain, contract_id: &str) -> Result<String, ExecutionError> {
        tracing::info!("submitting refund on {chain} for contract {contract_id}");
        match chain {
            Chain::Evm => {
                let calldata = refund_calldata(contract_id)
                    .map_err(|e| ExecutionError::Permanent(e.to_string()))?;
                self.evm.submit(calldata).await
            }
            Chain::Move => self.move_chain.submit("refund", json!([contract_id])).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    fn hex32(byte: u8) -> String {
        format!("0x{}", hex::encode([byte; 32]))
    }

    #[test]
    fn test_withdraw_calldata_layout() {
        let calldata = withdraw_calldata(&hex32(0xaa), &hex32(0x42)).unwrap();
        let bytes = hex::decode(&calldata[2..]).unwrap();
        assert_eq!(bytes.len(), 4 + 32 + 32);
        assert_eq!(&bytes[..4], &selector("withdraw(bytes32,bytes32)"));
        assert_eq!(&bytes[4..36], &[0xaa; 32]);
        assert_eq!(&bytes[36..68], &[0x42; 32]);
    }

    #[test]
    fn test_refund_calldata_layout() {
        let calldata = refund_calldata(&hex32(0xaa)).unwrap();
        let bytes = hex::decode(&calldata[2..]).unwrap();
        assert_eq!(bytes.len(), 4 + 32);
        assert_eq!(&bytes[..4], &selector("refund(bytes32)"));
    }

    #[test]
    fn test_selectors_differ() {
        assert_ne!(
            selector("withdraw(bytes32,bytes32)"),
            selector("refund(bytes32)")
        );
    }

    #[test]
    fn test_error_classification() {
        let already = ExecutionError::from_rpc(RelayerError::ChainRpc(
            "execution reverted: HTLC already withdrawn".into(),
        ));
        assert!(matches!(already, ExecutionError::AlreadySettled(_)));

        let reverted =
            ExecutionError::from_rpc(RelayerError::ChainRpc("execution revert: bad lock".into()));
        assert!(matches!(reverted, ExecutionError::Permanent(_)));

        let timeout = ExecutionError::from_rpc(RelayerError::ChainRpc("request timed out".into()));
        assert!(timeout.is_transient());
    }

    #[test]
    fn test_move_signing_round_trip() {
        let signer = SigningKey::from_bytes(&[7u8; 32]);
        let message = b"tx bytes from the node";
        let signature = signer.sign(message);
        assert!(signer.verifying_key().verify(message, &signature).is_ok());
        assert_eq!(signature.to_bytes().len(), 64);
    }
}
