// Error types for the Crosslock relayer core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Chain RPC error: {0}")]
    ChainRpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Swap not found: {0}")]
    SwapNotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("preimage verification failed")]
    PreimageMismatch,

    #[error("pairing mismatch: {0}")]
    PairingMismatch(String),

    #[error("Invalid timelock: {0}")]
    InvalidTimelock(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Push session error: {0}")]
    Push(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<anyhow::Error> for RelayerError {
    fn from(err: anyhow::Error) -> Self {
        RelayerError::Other(err.to_string())
    }
}

impl From<&str> for RelayerError {
    fn from(err: &str) -> Self {
        RelayerError::Other(err.to_string())
    }
}

impl RelayerError {
    /// Whether a retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayerError::ChainRpc(_)
                | RelayerError::Http(_)
                | RelayerError::Io(_)
                | RelayerError::Database(_)
        )
    }
}
