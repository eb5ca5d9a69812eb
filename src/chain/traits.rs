//! Per-chain constants and codecs
//!
//! One engine instance serves every supported external chain; everything
//! chain-specific (decimals, address format, gas limits, multi-sig call
//! encoding) is supplied through this capability.

use ethers::types::{H256, U256};

use super::rpc::{RpcError, RpcErrorKind};

/// Chain-specific constants and codecs (consumed capability)
#[cfg_attr(test, mockall::automock)]
pub trait ChainTraits: Send + Sync {
    /// Chain name used in keys, logs and metrics labels
    fn chain_name(&self) -> &str;
    fn native_symbol(&self) -> &str;
    fn native_decimals(&self) -> u8;
    /// Address validity in this chain's format (hex, base58, ...)
    fn valid_address(&self, address: &str) -> bool;
    /// Gas limit for a plain value transfer (used for override self-sends)
    fn transfer_gas_limit(&self) -> U256;
    /// Gas limit for multi-sig contract calls
    fn multisig_gas_limit(&self) -> U256;
    /// Floor below which the chain drops transactions outright
    fn min_gas_price(&self) -> U256;
    /// Encode the read-only query asking the multi-sig contract whether the
    /// action identified by this home tx hash has already been executed
    fn encode_completion_query(&self, home_tx_hash: &H256) -> Vec<u8>;
    /// Decode the completion-query response
    fn decode_completion(&self, output: &[u8]) -> bool;
    /// Whether an error from `call`/`estimate_gas` means the action is
    /// already completed on the contract (revert-as-done)
    fn is_completed_revert(&self, error: &RpcError) -> bool;
}

/// Shared default: treat an `AlreadyExecuted`-style revert marker as done
pub fn revert_marks_completion(error: &RpcError, marker: &str) -> bool {
    error.kind == RpcErrorKind::Rpc && error.message.contains(marker)
}
