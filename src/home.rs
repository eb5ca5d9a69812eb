//! Home-chain collaborator capabilities
//!
//! The engine never talks to the home chain directly; the host node supplies
//! these implementations. Both callbacks must be idempotent: a duplicate
//! submission returns `HomeChainError::Duplicate`, which the coordinators
//! treat as success-already-applied.

use ethers::types::{H256, U256};

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::engine::ledger::TxKind;

/// Errors surfaced by the home-chain callback
#[derive(Error, Debug, Clone)]
pub enum HomeChainError {
    /// The submission was already applied by this or another director
    #[error("duplicate submission")]
    Duplicate,

    /// The home chain rejected the submission as invalid
    #[error("rejected: {0}")]
    Rejected(String),

    /// The home chain could not be reached; retry later
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl HomeChainError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HomeChainError::Unavailable(_))
    }
}

/// A deposit observed on an external chain, ready to be minted at home
#[derive(Debug, Clone)]
pub struct DepositSubmission {
    pub external_tx_hash: H256,
    pub block_height: u64,
    pub from: String,
    pub to: String,
    pub amount: U256,
    pub time: i64,
    pub decimals: u8,
    pub is_contract_asset: bool,
    pub contract_address: Option<String>,
    pub asset_id: String,
    pub home_address: String,
}

/// A confirmed outbound broadcast, reported back to the home chain
#[derive(Debug, Clone)]
pub struct BroadcastConfirmation {
    pub kind: TxKind,
    pub home_tx_hash: H256,
    pub external_tx_hash: H256,
    pub block_height: u64,
    pub time: i64,
    pub multisig_address: String,
    pub signers: Vec<String>,
}

/// Callback into the home chain (consumed capability)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HomeChainCallback: Send + Sync {
    /// Relay a deposit; returns the home-chain mint tx hash
    async fn submit_deposit(&self, deposit: &DepositSubmission) -> Result<H256, HomeChainError>;

    /// Report a confirmed outbound broadcast with its signer set
    async fn confirm_broadcast(
        &self,
        confirmation: &BroadcastConfirmation,
    ) -> Result<H256, HomeChainError>;

    /// Whether the home chain already recorded this broadcast as confirmed
    async fn broadcast_confirmed(&self, home_tx_hash: H256) -> Result<bool, HomeChainError>;
}

/// Local node's view of the bank-director roster (consumed capability)
#[cfg_attr(test, mockall::automock)]
pub trait DirectorRosterProvider: Send + Sync {
    /// Node-level run flag; ticks skip their cycle while false
    fn is_running(&self) -> bool;
    /// Whether this node is currently in the director quorum
    fn is_director(&self) -> bool;
    /// This node's rank in the broadcast order, 1-based
    fn node_rank(&self) -> Option<u32>;
    /// Full address -> rank assignment for the current quorum
    fn roster(&self) -> BTreeMap<String, u32>;
    /// This node's signing address on the external chain
    fn node_address(&self) -> String;
    /// Current home-chain height
    fn home_height(&self) -> u64;
}

/// USD price source for acceleration-fee computation (consumed capability)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// USD price of the external chain's native asset, if known
    async fn native_usd(&self, chain: &str) -> Option<f64>;
    /// USD value of a withdrawal fee expressed in home-chain fee units
    async fn fee_usd(&self, fee: U256) -> Option<f64>;
}
