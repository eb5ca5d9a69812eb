//! Error types for the bridge engine

use crate::chain::rpc::RpcError;
use crate::home::HomeChainError;
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("RPC error on chain {chain}: {source}")]
    Rpc {
        chain: String,
        #[source]
        source: RpcError,
    },

    #[error("Home chain callback error: {0}")]
    HomeChain(#[from] HomeChainError),

    #[error("Fork detected on chain {chain} at height {height}")]
    ForkDetected { chain: String, height: u64 },

    #[error("Block {height} unavailable on chain {chain}")]
    BlockUnavailable { chain: String, height: u64 },

    #[error("Transaction {tx_hash} not found on chain {chain}")]
    TransactionNotFound { chain: String, tx_hash: String },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Insufficient acceleration fee: computed {computed}, floor {floor}")]
    InsufficientFee { computed: String, floor: String },

    #[error("Resend budget exhausted for {key}")]
    ResendExhausted { key: String },

    #[error("Record {key} corrupt in store: {message}")]
    CorruptRecord { key: String, message: String },

    #[error("Startup barrier timed out after {secs}s")]
    StartupTimeout { secs: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Check if the error is transient and the operation should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Rpc { source, .. } => source.is_retryable(),
            EngineError::HomeChain(e) => e.is_retryable(),
            EngineError::BlockUnavailable { .. } | EngineError::ForkDetected { .. } => true,
            _ => false,
        }
    }

    /// Check if the error should surface to operators beyond normal logs
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            EngineError::ForkDetected { .. }
                | EngineError::ResendExhausted { .. }
                | EngineError::CorruptRecord { .. }
                | EngineError::Signing(_)
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Store(e.to_string())
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
