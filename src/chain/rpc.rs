//! External-chain RPC capability
//!
//! Wire encoding (ABI, signing curves, serialization) lives in the host
//! node's per-chain client; the engine consumes this narrow surface and
//! switches on typed error kinds rather than message contents.

use ethers::types::{H256, U256};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Classified RPC failure, switched on by the endpoint manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// The call did not complete within the per-call timeout
    Timeout,
    /// Host unreachable, connection reset, TLS failure
    Connection,
    /// Endpoint quota or rate limit hit
    RateLimited,
    /// The endpoint answered with an error (including reverts)
    Rpc,
}

#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(op: &str) -> Self {
        Self::new(RpcErrorKind::Timeout, format!("timed out: {}", op))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            RpcErrorKind::Timeout | RpcErrorKind::Connection | RpcErrorKind::RateLimited
        )
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

/// Block header as observed on the external chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub timestamp: i64,
}

/// Full block handed to the per-type analyzer
#[derive(Debug, Clone)]
pub struct BlockData {
    pub header: BlockHeader,
    pub tx_hashes: Vec<H256>,
}

/// Minimal transaction view for direct hash lookups
#[derive(Debug, Clone)]
pub struct TxInfo {
    pub hash: H256,
    pub block_height: Option<u64>,
    pub from: String,
    pub to: Option<String>,
    pub value: U256,
}

#[derive(Debug, Clone)]
pub struct ReceiptLog {
    pub address: String,
    pub data: Vec<u8>,
}

/// Transaction receipt view
#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_height: Option<u64>,
    pub success: bool,
    pub logs: Vec<ReceiptLog>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceKind {
    Pending,
    Latest,
}

/// Thin per-chain RPC client (consumed capability)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainRpcClient: Send + Sync {
    async fn tip_height(&self) -> RpcResult<u64>;
    async fn block(&self, height: u64) -> RpcResult<Option<BlockData>>;
    async fn block_header(&self, height: u64) -> RpcResult<Option<BlockHeader>>;
    async fn transaction(&self, hash: H256) -> RpcResult<Option<TxInfo>>;
    async fn receipt(&self, hash: H256) -> RpcResult<Option<TxReceipt>>;
    async fn balance(&self, address: &str) -> RpcResult<U256>;
    async fn nonce(&self, address: &str, kind: NonceKind) -> RpcResult<u64>;
    async fn network_gas_price(&self) -> RpcResult<U256>;
    /// Read-only contract call
    async fn call(&self, from: &str, contract: &str, data: &[u8]) -> RpcResult<Vec<u8>>;
    async fn estimate_gas(
        &self,
        from: &str,
        to: &str,
        data: &[u8],
        value: U256,
    ) -> RpcResult<U256>;
    async fn send_raw_transaction(&self, signed: &[u8]) -> RpcResult<H256>;
}

/// An unsigned replacement/broadcast plan handed to the signer
#[derive(Debug, Clone)]
pub struct TxPlan {
    pub to: String,
    pub value: U256,
    pub data: Vec<u8>,
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: U256,
}

/// Signs transaction plans with this node's external-chain key
/// (signing primitives live with the host node's key management)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TxSigner: Send + Sync {
    /// This node's address on the external chain
    fn address(&self) -> String;
    async fn sign(&self, plan: &TxPlan) -> RpcResult<Vec<u8>>;
}

/// Immediate-retry policy for a single RPC call: a bounded number of quick
/// retries with a short sleep, then the failure surfaces to the caller
pub const RPC_RETRIES: u32 = 2;
pub const RPC_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Run `op` with bounded immediate retries on retryable errors
pub async fn with_retries<T, F, Fut>(mut op: F) -> RpcResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = RpcResult<T>>,
{
    let mut last = None;
    for attempt in 0..=RPC_RETRIES {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !e.is_retryable() || attempt == RPC_RETRIES {
                    return Err(e);
                }
                last = Some(e);
                tokio::time::sleep(RPC_RETRY_DELAY).await;
            }
        }
    }
    // Loop always returns; kept for the compiler
    Err(last.unwrap_or_else(|| RpcError::new(RpcErrorKind::Rpc, "retry loop exhausted")))
}
