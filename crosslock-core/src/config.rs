use serde::{Deserialize, Serialize};

use crate::error::RelayerError;

/// Top-level relayer configuration.
///
/// Loading order in the binary is environment -> config file -> defaults;
/// `validate()` runs once at startup and failures are fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayerConfig {
    pub evm: EvmConfig,
    pub move_chain: MoveConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub monitoring: MonitoringConfig,
    pub expiry: ExpiryConfig,
    pub push: PushConfig,
    pub pairing: PairingConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvmConfig {
    pub rpc_url: String,
    /// WebSocket endpoint for live log subscriptions. Polling is used when
    /// absent or after the subscription fails.
    pub push_url: Option<String>,
    pub chain_id: u64,
    pub htlc_address: String,
    pub start_block: Option<u64>,
    pub confirmations: u64,
    pub batch_size: u64,
    /// Account the node signs withdrawal/refund calls from.
    pub relayer_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveConfig {
    pub rpc_url: String,
    pub network: MoveNetwork,
    pub package_id: String,
    pub start_checkpoint: Option<u64>,
    pub batch_size: u64,
    /// Hex-encoded ed25519 signing key for withdrawal/refund transactions.
    pub signer_key: String,
    pub sender_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveNetwork {
    Mainnet,
    Testnet,
    Devnet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for cached raw chain events.
    pub event_ttl_secs: u64,
    /// TTL for cached admin query results.
    pub query_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub poll_interval_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryConfig {
    pub sweep_interval_secs: u64,
    /// How long terminal swaps stay in the hot cache.
    pub terminal_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    pub heartbeat_secs: u64,
    pub idle_timeout_secs: u64,
    /// Outbound queue depth per subscriber before it is considered slow.
    pub send_queue_depth: usize,
}

/// Cross-chain party compatibility rule for pairing the two legs of a swap.
///
/// An address on one chain says nothing about who controls an address on the
/// other, so identity across chains is an operator-maintained mapping: each
/// [`PartyLink`] declares that one participant controls both addresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Reject a pairing whose parties are not linked below. When unset, the
    /// hashlock and amount checks alone decide compatibility.
    pub require_party_match: bool,
    pub party_links: Vec<PartyLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyLink {
    pub evm: String,
    pub move_chain: String,
}

impl PairingConfig {
    pub fn linked(&self, evm_address: &str, move_address: &str) -> bool {
        self.party_links.iter().any(|link| {
            link.evm.eq_ignore_ascii_case(evm_address)
                && link.move_chain.eq_ignore_ascii_case(move_address)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            evm: EvmConfig {
                rpc_url: "http://127.0.0.1:8545".to_string(),
                push_url: None,
                chain_id: 1,
                htlc_address: String::new(),
                start_block: None,
                confirmations: 12,
                batch_size: 1000,
                relayer_address: String::new(),
            },
            move_chain: MoveConfig {
                rpc_url: "http://127.0.0.1:9000".to_string(),
                network: MoveNetwork::Testnet,
                package_id: String::new(),
                start_checkpoint: None,
                batch_size: 100,
                signer_key: String::new(),
                sender_address: String::new(),
            },
            store: StoreConfig {
                database_url: "sqlite://crosslock.db".to_string(),
                max_connections: 8,
                busy_timeout_ms: 5000,
            },
            cache: CacheConfig {
                event_ttl_secs: 24 * 3600,
                query_ttl_secs: 30,
            },
            monitoring: MonitoringConfig {
                poll_interval_ms: 5000,
                max_retries: 3,
                retry_delay_ms: 1000,
            },
            expiry: ExpiryConfig {
                sweep_interval_secs: 300,
                terminal_grace_secs: 300,
            },
            push: PushConfig {
                heartbeat_secs: 15,
                idle_timeout_secs: 30,
                send_queue_depth: 64,
            },
            pairing: PairingConfig::default(),
            api: ApiConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
        }
    }
}

impl RelayerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: RelayerConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Build from environment variables, starting from defaults. Only the
    /// options operators override in practice are read here; everything else
    /// comes from the config file.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("CROSSLOCK_EVM_RPC_URL") {
            config.evm.rpc_url = url;
        }
        if let Ok(url) = std::env::var("CROSSLOCK_EVM_PUSH_URL") {
            config.evm.push_url = Some(url);
        }
        if let Ok(addr) = std::env::var("CROSSLOCK_EVM_HTLC_ADDRESS") {
            config.evm.htlc_address = addr;
        }
        if let Ok(addr) = std::env::var("CROSSLOCK_EVM_RELAYER_ADDRESS") {
            config.evm.relayer_address = addr;
        }
        if let Ok(id) = std::env::var("CROSSLOCK_EVM_CHAIN_ID") {
            config.evm.chain_id = id.parse()?;
        }
        if let Ok(url) = std::env::var("CROSSLOCK_MOVE_RPC_URL") {
            config.move_chain.rpc_url = url;
        }
        if let Ok(id) = std::env::var("CROSSLOCK_MOVE_PACKAGE_ID") {
            config.move_chain.package_id = id;
        }
        if let Ok(key) = std::env::var("CROSSLOCK_MOVE_SIGNER_KEY") {
            config.move_chain.signer_key = key;
        }
        if let Ok(addr) = std::env::var("CROSSLOCK_MOVE_SENDER_ADDRESS") {
            config.move_chain.sender_address = addr;
        }
        if let Ok(url) = std::env::var("CROSSLOCK_DATABASE_URL") {
            config.store.database_url = url;
        }
        if let Ok(host) = std::env::var("CROSSLOCK_API_HOST") {
            config.api.host = host;
        }
        if let Ok(port) = std::env::var("CROSSLOCK_API_PORT") {
            config.api.port = port.parse()?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RelayerError> {
        if self.evm.rpc_url.is_empty() {
            return Err(RelayerError::Config("evm.rpc_url is required".into()));
        }
        if self.evm.htlc_address.is_empty() {
            return Err(RelayerError::Config("evm.htlc_address is required".into()));
        }
        if self.evm.confirmations == 0 {
            return Err(RelayerError::Config(
                "evm.confirmations must be at least 1".into(),
            ));
        }
        if self.evm.batch_size == 0 || self.move_chain.batch_size == 0 {
            return Err(RelayerError::Config("batch_size must be nonzero".into()));
        }
        if self.move_chain.rpc_url.is_empty() {
            return Err(RelayerError::Config("move.rpc_url is required".into()));
        }
        if self.move_chain.package_id.is_empty() {
            return Err(RelayerError::Config("move.package_id is required".into()));
        }
        if self.store.database_url.is_empty() {
            return Err(RelayerError::Config("store.database_url is required".into()));
        }
        if self.monitoring.poll_interval_ms == 0 {
            return Err(RelayerError::Config(
                "monitoring.poll_interval must be nonzero".into(),
            ));
        }
        if self.push.idle_timeout_secs <= self.push.heartbeat_secs {
            return Err(RelayerError::Config(
                "push.idle_timeout must exceed push.heartbeat".into(),
            ));
        }
        if self.pairing.require_party_match && self.pairing.party_links.is_empty() {
            return Err(RelayerError::Config(
                "pairing.require_party_match set without pairing.party_links".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_incomplete() {
        // Contract addresses have no sensible default; validation must catch
        // an operator who forgot to set them.
        let config = RelayerConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_filled_config() {
        let mut config = RelayerConfig::default();
        config.evm.htlc_address = "0x00000000000000000000000000000000000000aa".into();
        config.move_chain.package_id = "0xbb".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_heartbeat_must_beat_idle_timeout() {
        let mut config = RelayerConfig::default();
        config.evm.htlc_address = "0xaa".into();
        config.move_chain.package_id = "0xbb".into();
        config.push.heartbeat_secs = 60;
        config.push.idle_timeout_secs = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_party_match_requires_links() {
        let mut config = RelayerConfig::default();
        config.evm.htlc_address = "0xaa".into();
        config.move_chain.package_id = "0xbb".into();
        config.pairing.require_party_match = true;
        assert!(config.validate().is_err());

        config.pairing.party_links.push(PartyLink {
            evm: "0x1111111111111111111111111111111111111111".into(),
            move_chain: "0xabc".into(),
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_party_links_are_case_insensitive() {
        let pairing = PairingConfig {
            require_party_match: true,
            party_links: vec![PartyLink {
                evm: "0xAAAA1111111111111111111111111111111111AA".into(),
                move_chain: "0xMoveAddr".into(),
            }],
        };
        assert!(pairing.linked(
            "0xaaaa1111111111111111111111111111111111aa",
            "0xmoveaddr"
        ));
        assert!(!pairing.linked(
            "0xaaaa1111111111111111111111111111111111aa",
            "0xother"
        ));
    }
}
