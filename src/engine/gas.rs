//! Replacement-price computation and stuck-transaction eviction
//!
//! A stuck broadcast is first checked against the multi-sig contract: if the
//! action already executed (someone else's tx landed), the stuck nonce is
//! evicted with a zero-value self-transfer instead of a replacement. Otherwise
//! a replacement at a higher price is sent with the same nonce and recorded as
//! a new `SentTransactionRecord`.

use crate::chain::{ChainTraits, RpcEndpointManager, TxPlan, TxSigner};
use crate::engine::ledger::{SentTransactionRecord, TxKind, UnconfirmedTx, UnconfirmedTxLedger};
use crate::error::{EngineError, EngineResult};
use crate::home::PriceFeed;

use chrono::Utc;
use ethers::types::{H256, U256};
use std::sync::Arc;
use tracing::{info, warn};

/// Fixed increment added on top of the reference price
fn gas_bump() -> U256 {
    U256::from(2_000_000_000u64) // 2 gwei
}

/// Replacement price ceiling relative to the current network price
fn price_cap(network: U256) -> U256 {
    network * 110u64 / 100u64
}

#[derive(Debug, PartialEq, Eq)]
pub enum AccelerationOutcome {
    /// A replacement at a higher price was broadcast
    Replaced(H256),
    /// The action was already complete; the nonce was evicted with a
    /// zero-value self-transfer
    Overridden(H256),
    /// The recorded price already sits at the cap; nothing to do
    AtCap,
}

pub struct GasAccelerator {
    chain: String,
    endpoints: Arc<RpcEndpointManager>,
    traits_: Arc<dyn ChainTraits>,
    signer: Arc<dyn TxSigner>,
    ledger: Arc<UnconfirmedTxLedger>,
    prices: Arc<dyn PriceFeed>,
    multisig_address: String,
}

impl GasAccelerator {
    pub fn new(
        chain: &str,
        endpoints: Arc<RpcEndpointManager>,
        traits_: Arc<dyn ChainTraits>,
        signer: Arc<dyn TxSigner>,
        ledger: Arc<UnconfirmedTxLedger>,
        prices: Arc<dyn PriceFeed>,
        multisig_address: String,
    ) -> Self {
        Self {
            chain: chain.to_string(),
            endpoints,
            traits_,
            signer,
            ledger,
            prices,
            multisig_address,
        }
    }

    /// Accelerate a previously broadcast, still-unconfirmed transaction
    pub async fn accelerate(&self, entry: &UnconfirmedTx) -> EngineResult<AccelerationOutcome> {
        let tx_hash = entry.tx_hash.ok_or_else(|| {
            EngineError::Internal("acceleration requires a broadcast tx hash".to_string())
        })?;
        let sent = self.ledger.sent_record(&tx_hash).await?.ok_or_else(|| {
            EngineError::Internal(format!("no sent record for {:?}", tx_hash))
        })?;

        // The action may have completed through another director's tx; then
        // only the stuck nonce needs evicting
        if let Some(home_tx_hash) = entry.home_tx_hash {
            if self.contract_completed(&home_tx_hash).await? {
                let hash = self.send_override(&sent).await?;
                return Ok(AccelerationOutcome::Overridden(hash));
            }
        }

        let network = self
            .endpoints
            .execute(&self.chain, |c| async move { c.network_gas_price().await })
            .await?;

        let new_price = if entry.kind == TxKind::Withdraw {
            self.withdrawal_price(entry, &sent).await?
        } else {
            let cap = price_cap(network);
            if sent.gas_price >= cap {
                return Ok(AccelerationOutcome::AtCap);
            }
            (sent.gas_price.max(network) + gas_bump()).min(cap)
        };

        // Re-validate the call at the new price; a revert meaning "already
        // executed" switches to the override path
        let from = self.signer.address();
        let estimate = self
            .endpoints
            .execute(&self.chain, |c| {
                let from = from.clone();
                let to = sent.to.clone();
                let data = sent.data.clone();
                let value = sent.value;
                async move { c.estimate_gas(&from, &to, &data, value).await }
            })
            .await;
        if let Err(EngineError::Rpc { ref source, .. }) = estimate {
            if self.traits_.is_completed_revert(source) {
                let hash = self.send_override(&sent).await?;
                return Ok(AccelerationOutcome::Overridden(hash));
            }
        }

        let plan = TxPlan {
            to: sent.to.clone(),
            value: sent.value,
            data: sent.data.clone(),
            nonce: sent.nonce,
            gas_price: new_price,
            gas_limit: sent.gas_limit,
        };
        let replacement = self.sign_and_send(&plan).await?;

        info!(
            "Chain {}: accelerated {:?} -> {:?} at {} (was {})",
            self.chain, sent.tx_hash, replacement, new_price, sent.gas_price
        );

        // Supersede, never mutate: the replacement gets its own record
        self.ledger
            .record_sent(&SentTransactionRecord {
                tx_hash: replacement,
                from: self.signer.address(),
                nonce: sent.nonce,
                gas_price: new_price,
                gas_limit: sent.gas_limit,
                to: sent.to.clone(),
                data: sent.data.clone(),
                value: sent.value,
                sent_at: Utc::now().timestamp(),
            })
            .await?;

        let mut updated = entry.clone();
        updated.tx_hash = Some(replacement);
        updated.block_height = None;
        updated.height_checks = 0;
        updated.sent_by_local = true;
        self.ledger.update(&updated).await?;

        crate::metrics::record_acceleration(&self.chain);
        Ok(AccelerationOutcome::Replaced(replacement))
    }

    /// Withdrawal replacement price: the paid fee converted to native units,
    /// spread over the gas limit. Monotonic in the fee, inverse in the
    /// native-asset price. Rejected when it does not beat the recorded price.
    async fn withdrawal_price(
        &self,
        entry: &UnconfirmedTx,
        sent: &SentTransactionRecord,
    ) -> EngineResult<U256> {
        let fee_usd = self.prices.fee_usd(entry.fee).await.ok_or_else(|| {
            EngineError::Internal("fee USD price unavailable".to_string())
        })?;
        let native_usd = self
            .prices
            .native_usd(&self.chain)
            .await
            .ok_or_else(|| EngineError::Internal("native USD price unavailable".to_string()))?;
        if native_usd <= 0.0 {
            return Err(EngineError::Internal("native USD price not positive".to_string()));
        }

        let decimals = i32::from(self.traits_.native_decimals());
        let gas_limit = sent.gas_limit.as_u128().max(1) as f64;
        let price_wei = fee_usd / native_usd * 10f64.powi(decimals) / gas_limit;
        let computed = U256::from(price_wei.max(0.0) as u128);

        if computed <= sent.gas_price {
            warn!(
                "Chain {}: withdrawal fee funds {} per gas, recorded {}",
                self.chain, computed, sent.gas_price
            );
            return Err(EngineError::InsufficientFee {
                computed: computed.to_string(),
                floor: sent.gas_price.to_string(),
            });
        }
        Ok(computed)
    }

    /// Zero-value self-transfer reusing the stuck nonce at a higher price
    async fn send_override(&self, sent: &SentTransactionRecord) -> EngineResult<H256> {
        let network = self
            .endpoints
            .execute(&self.chain, |c| async move { c.network_gas_price().await })
            .await?;
        let me = self.signer.address();
        let plan = TxPlan {
            to: me,
            value: U256::zero(),
            data: Vec::new(),
            nonce: sent.nonce,
            gas_price: sent.gas_price.max(network) + gas_bump(),
            gas_limit: self.traits_.transfer_gas_limit(),
        };
        let hash = self.sign_and_send(&plan).await?;
        info!(
            "Chain {}: evicted stuck nonce {} with override {:?}",
            self.chain, sent.nonce, hash
        );
        crate::metrics::record_acceleration(&self.chain);
        Ok(hash)
    }

    async fn sign_and_send(&self, plan: &TxPlan) -> EngineResult<H256> {
        let signed = self
            .signer
            .sign(plan)
            .await
            .map_err(|e| EngineError::Signing(e.to_string()))?;
        self.endpoints
            .execute(&self.chain, |c| {
                let signed = signed.clone();
                async move { c.send_raw_transaction(&signed).await }
            })
            .await
    }

    async fn contract_completed(&self, home_tx_hash: &H256) -> EngineResult<bool> {
        let data = self.traits_.encode_completion_query(home_tx_hash);
        let from = self.signer.address();
        let contract = self.multisig_address.clone();
        let output = self
            .endpoints
            .execute(&self.chain, |c| {
                let from = from.clone();
                let contract = contract.clone();
                let data = data.clone();
                async move { c.call(&from, &contract, &data).await }
            })
            .await?;
        Ok(self.traits_.decode_completion(&output))
    }
}
