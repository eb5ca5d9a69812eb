//! Per-cycle driver of the unconfirmed-transaction state machine
//!
//! Each tick drains a snapshot of the ledger queue and moves every entry one
//! step: waiting for a block height, cooling down, accumulating confirmation
//! depth, validating receipts, relaying deposits, arbitrating failed
//! broadcasts and reporting confirmed ones. Entries leave the queue only when
//! definitively invalid, superseded, or past their rollback-safety window.

use crate::chain::RpcEndpointManager;
use crate::engine::broadcast::BroadcastOrderCoordinator;
use crate::engine::gas::GasAccelerator;
use crate::engine::ledger::{TxKind, TxStatus, UnconfirmedTx, UnconfirmedTxLedger};
use crate::engine::scanner::ChainTipHeader;
use crate::error::{EngineError, EngineResult};
use crate::home::{
    BroadcastConfirmation, DepositSubmission, DirectorRosterProvider, HomeChainCallback,
    HomeChainError,
};
use crate::store::{decode, PersistentStore};

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cycles an entry may wait for its block height before a direct hash lookup
const HEIGHT_CHECK_LIMIT: u32 = 10;
/// Age after which an unpacked local broadcast is accelerated
const UNPACKED_TIMEOUT_SECS: i64 = 180;
/// Age after which a packed broadcast with no receipt is marked for resend
const RECEIPT_TIMEOUT_SECS: i64 = 1200;
/// Cooldown rounds after a successful revalidation
const REVALIDATION_SKIP_ROUNDS: u32 = 2;
/// Home blocks to wait before physically purging a deleted entry
const ROLLBACK_SAFETY_BLOCKS: u64 = 100;

enum Flow {
    /// Re-enqueue the processed copy
    Keep,
    /// Re-enqueue whatever another component stored for this key
    KeepFresh,
    /// Remove from queue and store
    Drop,
    /// Remove this entry and end the cycle (recovery signal)
    StopCycle,
}

pub struct ConfirmationCoordinator {
    chain: String,
    store: Arc<dyn PersistentStore>,
    endpoints: Arc<RpcEndpointManager>,
    ledger: Arc<UnconfirmedTxLedger>,
    broadcast: Arc<BroadcastOrderCoordinator>,
    gas: Arc<GasAccelerator>,
    home: Arc<dyn HomeChainCallback>,
    roster: Arc<dyn DirectorRosterProvider>,
    multisig_address: String,
    deposit_depth: u64,
    withdraw_depth: u64,
    max_errors: u32,
    resend_limit: u32,
}

impl ConfirmationCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: &str,
        store: Arc<dyn PersistentStore>,
        endpoints: Arc<RpcEndpointManager>,
        ledger: Arc<UnconfirmedTxLedger>,
        broadcast: Arc<BroadcastOrderCoordinator>,
        gas: Arc<GasAccelerator>,
        home: Arc<dyn HomeChainCallback>,
        roster: Arc<dyn DirectorRosterProvider>,
        multisig_address: String,
        deposit_depth: u64,
        withdraw_depth: u64,
        max_errors: u32,
        resend_limit: u32,
    ) -> Self {
        Self {
            chain: chain.to_string(),
            store,
            endpoints,
            ledger,
            broadcast,
            gas,
            home,
            roster,
            multisig_address,
            deposit_depth,
            withdraw_depth,
            max_errors,
            resend_limit,
        }
    }

    /// One confirmation cycle over a snapshot of the queue
    pub async fn tick(&self) -> EngineResult<()> {
        if !self.roster.is_running() || !self.roster.is_director() {
            return Ok(());
        }

        let remote_tip = self
            .endpoints
            .execute(&self.chain, |c| async move { c.tip_height().await })
            .await?;

        let n = self.ledger.snapshot_len().await;
        crate::metrics::record_unconfirmed_depth(&self.chain, n);

        for _ in 0..n {
            let Some(mut entry) = self.ledger.pop().await else { break };
            let key = entry.record_key();
            match self.process(&mut entry, remote_tip).await {
                Ok(Flow::Keep) => self.ledger.requeue(entry).await?,
                Ok(Flow::KeepFresh) => {
                    let fresh = self.ledger.get(&key).await.unwrap_or(entry);
                    self.ledger.requeue(fresh).await?;
                }
                Ok(Flow::Drop) => self.ledger.remove(&key).await?,
                Ok(Flow::StopCycle) => {
                    self.ledger.remove(&key).await?;
                    break;
                }
                Err(e) => {
                    // Never lose the in-flight entry to an unexpected error
                    entry.error_count += 1;
                    warn!(
                        "Chain {}: entry {} errored ({} consecutive): {}",
                        self.chain, key, entry.error_count, e
                    );
                    self.ledger.requeue(entry).await?;
                }
            }
        }
        Ok(())
    }

    async fn process(&self, entry: &mut UnconfirmedTx, remote_tip: u64) -> EngineResult<Flow> {
        // A recovery signal supersedes any queued administrator change
        if entry.kind == TxKind::Recovery {
            let purged = self.ledger.purge_kind(TxKind::Change).await?;
            info!(
                "Chain {}: recovery signal purged {} stale change entries",
                self.chain, purged
            );
            return Ok(Flow::StopCycle);
        }

        // Poison-entry guard
        if entry.error_count > self.max_errors {
            warn!(
                "Chain {}: dropping {} after {} consecutive errors",
                self.chain,
                entry.record_key(),
                entry.error_count
            );
            return Ok(Flow::Drop);
        }

        // Outbound entries that were never broadcast have nothing to confirm
        // yet; they wait for the broadcast coordinator
        if entry.tx_hash.is_none() {
            return Ok(Flow::Keep);
        }

        if entry.block_height.is_none() {
            return self.await_block_height(entry).await;
        }

        if entry.skip_rounds > 0 {
            entry.skip_rounds -= 1;
            return Ok(Flow::Keep);
        }

        // Withdrawals move real value off the bridge and need deeper finality
        let required = if entry.kind == TxKind::Deposit {
            self.deposit_depth
        } else {
            self.withdraw_depth
        };
        let height = entry.block_height.unwrap_or(0);
        if remote_tip.saturating_sub(height) < required {
            return Ok(Flow::Keep);
        }

        match entry.kind {
            TxKind::Deposit => self.process_deposit(entry).await,
            _ => self.process_outbound(entry).await,
        }
    }

    /// The entry has no block height yet: reconcile with the store, then
    /// either look the tx up directly or accelerate a stuck local broadcast
    async fn await_block_height(&self, entry: &mut UnconfirmedTx) -> EngineResult<Flow> {
        if let Some(stored) = self.ledger.reconcile(entry).await? {
            if stored.block_height.is_some() {
                *entry = stored;
                return Ok(Flow::Keep);
            }
        }

        entry.height_checks += 1;
        let overdue = entry.height_checks > HEIGHT_CHECK_LIMIT;
        let stale = Utc::now().timestamp() - entry.created_at > UNPACKED_TIMEOUT_SECS;
        if !overdue && !(stale && entry.sent_by_local) {
            return Ok(Flow::Keep);
        }

        let tx_hash = entry.tx_hash.unwrap_or_default();
        let lookup = self
            .endpoints
            .execute(&self.chain, |c| async move { c.transaction(tx_hash).await })
            .await?;

        match lookup.and_then(|tx| tx.block_height) {
            Some(actual) => {
                if overdue {
                    if let Some(tip) = self.local_tip().await? {
                        if tip.height >= actual {
                            // The scanner already passed this block without
                            // producing the entry's event: another director
                            // handled it
                            debug!(
                                "Chain {}: {} already processed elsewhere",
                                self.chain,
                                entry.record_key()
                            );
                            return Ok(Flow::Drop);
                        }
                    }
                }
                entry.observe_height(actual);
                Ok(Flow::Keep)
            }
            None => {
                if stale && entry.sent_by_local {
                    // Never packed into a block: evict or replace it
                    match self.gas.accelerate(entry).await {
                        Ok(outcome) => {
                            info!("Chain {}: acceleration outcome {:?}", self.chain, outcome);
                            return Ok(Flow::KeepFresh);
                        }
                        Err(e) if e.is_retryable() => {
                            warn!("Chain {}: acceleration deferred: {}", self.chain, e)
                        }
                        Err(e) => warn!("Chain {}: acceleration failed: {}", self.chain, e),
                    }
                }
                Ok(Flow::Keep)
            }
        }
    }

    async fn process_deposit(&self, entry: &mut UnconfirmedTx) -> EngineResult<Flow> {
        if let Some(flow) = self.check_deletion_window(entry) {
            return Ok(flow);
        }

        if !entry.validated {
            let tx_hash = entry.tx_hash.unwrap_or_default();
            let receipt = self
                .endpoints
                .execute(&self.chain, |c| async move { c.receipt(tx_hash).await })
                .await?;

            let valid = match receipt {
                Some(r) => r.success && (!entry.asset.is_contract || !r.logs.is_empty()),
                None => false,
            };
            if !valid {
                // Keep the tombstone until the rollback-safety window passes
                entry.mark_deleted(self.roster.home_height() + ROLLBACK_SAFETY_BLOCKS);
                warn!(
                    "Chain {}: deposit {} failed validation, marked deleted",
                    self.chain,
                    entry.record_key()
                );
                return Ok(Flow::Keep);
            }
            entry.validated = true;
        }

        let submission = DepositSubmission {
            external_tx_hash: entry.tx_hash.unwrap_or_default(),
            block_height: entry.block_height.unwrap_or(0),
            from: entry.from.clone(),
            to: entry.to.clone(),
            amount: entry.value,
            time: entry.created_at,
            decimals: entry.asset.decimals,
            is_contract_asset: entry.asset.is_contract,
            contract_address: entry.asset.contract_address.clone(),
            asset_id: entry.asset.asset_id.clone(),
            home_address: entry.home_address.clone(),
        };

        match self.home.submit_deposit(&submission).await {
            Ok(home_tx_hash) => {
                info!(
                    "Chain {}: deposit {} relayed as {:?}",
                    self.chain,
                    entry.record_key(),
                    home_tx_hash
                );
                crate::metrics::record_deposit_relayed(&self.chain);
                Ok(Flow::Drop)
            }
            Err(HomeChainError::Duplicate) => {
                // Another director already relayed it
                debug!(
                    "Chain {}: deposit {} already relayed",
                    self.chain,
                    entry.record_key()
                );
                Ok(Flow::Drop)
            }
            Err(e) => {
                entry.error_count += 1;
                warn!(
                    "Chain {}: deposit submission failed ({}): {}",
                    self.chain, entry.error_count, e
                );
                Ok(Flow::Keep)
            }
        }
    }

    async fn process_outbound(&self, entry: &mut UnconfirmedTx) -> EngineResult<Flow> {
        if let Some(flow) = self.check_deletion_window(entry) {
            return Ok(flow);
        }

        match entry.status {
            // Still pending broadcast; the broadcast coordinator owns it
            TxStatus::Initial => Ok(Flow::Keep),
            TxStatus::Failed => self.arbitrate_failed(entry).await,
            TxStatus::Completed => self.validate_completed(entry).await,
        }
    }

    /// A broadcast failed on-chain: decide whether this node resends,
    /// following the rank order
    async fn arbitrate_failed(&self, entry: &mut UnconfirmedTx) -> EngineResult<Flow> {
        let Some(home_tx_hash) = entry.home_tx_hash else {
            return Ok(Flow::Drop);
        };

        if self.home.broadcast_confirmed(home_tx_hash).await? {
            return Ok(Flow::Drop);
        }

        let Some(waiting) = self.broadcast.waiting_for(&home_tx_hash).await else {
            // No waiting record; give the registration a few rounds to appear
            entry.error_count += 1;
            return Ok(if entry.error_count > self.max_errors {
                Flow::Drop
            } else {
                Flow::Keep
            });
        };

        if waiting.resend_count > self.resend_limit {
            warn!(
                "Chain {}: abandoning {} after {} resends",
                self.chain,
                entry.record_key(),
                waiting.resend_count
            );
            return Ok(Flow::Drop);
        }

        let my_rank = self.roster.node_rank();
        let me = self.roster.node_address();
        let i_sent = waiting.already_sent.contains(&me);
        let failed_rank = entry
            .sender
            .as_ref()
            .and_then(|s| waiting.signers.get(s).copied());
        let last_rank = waiting.signers.values().max().copied();

        match (failed_rank, my_rank) {
            // The rotation wrapped: restart it, rank 1 opens the new round
            (Some(failed), Some(_)) if Some(failed) == last_rank => {
                self.broadcast.reset_order(&home_tx_hash).await?;
                if my_rank == Some(1) {
                    self.broadcast.resend(&home_tx_hash).await?;
                }
                Ok(Flow::KeepFresh)
            }
            // Immediate successor of the failed sender takes over
            (Some(failed), Some(mine)) if mine == failed + 1 && !i_sent => {
                self.broadcast.resend(&home_tx_hash).await?;
                Ok(Flow::KeepFresh)
            }
            // Another node's responsibility
            _ => Ok(Flow::Drop),
        }
    }

    /// Re-check the broadcast transaction's receipt, then report the
    /// confirmation home
    async fn validate_completed(&self, entry: &mut UnconfirmedTx) -> EngineResult<Flow> {
        if !entry.validated {
            let tx_hash = entry.tx_hash.unwrap_or_default();
            let receipt = self
                .endpoints
                .execute(&self.chain, |c| async move { c.receipt(tx_hash).await })
                .await?;

            match receipt {
                None => {
                    let age = Utc::now().timestamp() - entry.created_at;
                    if age > RECEIPT_TIMEOUT_SECS {
                        entry.status = TxStatus::Failed;
                        warn!(
                            "Chain {}: no receipt for {:?} after {}s, marking for resend",
                            self.chain, entry.tx_hash, age
                        );
                    }
                    return Ok(Flow::Keep);
                }
                Some(r) if !r.success || r.logs.is_empty() => {
                    entry.status = TxStatus::Failed;
                    warn!(
                        "Chain {}: broadcast {:?} unsuccessful on-chain, marking for resend",
                        self.chain, entry.tx_hash
                    );
                    return Ok(Flow::Keep);
                }
                Some(r) => {
                    if let Some(h) = r.block_height {
                        entry.observe_height(h);
                    }
                    entry.validated = true;
                    // Short cooldown before reporting, in case of a shallow
                    // reorg right at the receipt boundary
                    entry.skip_rounds = REVALIDATION_SKIP_ROUNDS;
                    return Ok(Flow::Keep);
                }
            }
        }

        let Some(home_tx_hash) = entry.home_tx_hash else {
            return Ok(Flow::Drop);
        };
        let confirmation = BroadcastConfirmation {
            kind: entry.kind,
            home_tx_hash,
            external_tx_hash: entry.tx_hash.unwrap_or_default(),
            block_height: entry.block_height.unwrap_or(0),
            time: entry.created_at,
            multisig_address: self.multisig_address.clone(),
            signers: entry.signers.clone(),
        };

        match self.home.confirm_broadcast(&confirmation).await {
            Ok(_) | Err(HomeChainError::Duplicate) => {
                info!(
                    "Chain {}: broadcast {} confirmed at home",
                    self.chain,
                    entry.record_key()
                );
                self.broadcast.purge(&home_tx_hash).await?;
                crate::metrics::record_broadcast_confirmed(&self.chain);
                Ok(Flow::Drop)
            }
            Err(e) => {
                entry.error_count += 1;
                warn!(
                    "Chain {}: confirm_broadcast failed ({}): {}",
                    self.chain, entry.error_count, e
                );
                Ok(Flow::Keep)
            }
        }
    }

    /// Deleted entries are only purged once the home chain is safely past the
    /// rollback window; until then they are retained but never surfaced
    fn check_deletion_window(&self, entry: &UnconfirmedTx) -> Option<Flow> {
        if !entry.marked_deleted {
            return None;
        }
        match entry.delete_at_height {
            Some(limit) if self.roster.home_height() > limit => Some(Flow::Drop),
            _ => Some(Flow::Keep),
        }
    }

    async fn local_tip(&self) -> EngineResult<Option<ChainTipHeader>> {
        let key = format!("tip/{}", self.chain);
        match self.store.get(&key).await? {
            Some(bytes) => Ok(Some(decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::endpoints::RpcClientFactory;
    use crate::chain::rpc::{
        ChainRpcClient, MockChainRpcClient, MockTxSigner, ReceiptLog, TxInfo, TxReceipt,
    };
    use crate::chain::traits::testutil::TestTraits;
    use crate::config::ChainConfig;
    use crate::engine::ledger::{new_outbound_entry, AssetRef, SentTransactionRecord};
    use crate::home::{MockDirectorRosterProvider, MockHomeChainCallback, MockPriceFeed};
    use crate::store::{encode, MemoryStore};
    use ethers::types::{H256, U256};
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct FixedFactory(Arc<dyn ChainRpcClient>);

    impl RpcClientFactory for FixedFactory {
        fn connect(&self, _url: &str, _timeout: Duration) -> Arc<dyn ChainRpcClient> {
            self.0.clone()
        }
    }

    fn chain_config() -> ChainConfig {
        ChainConfig {
            name: "testnet".to_string(),
            rpc_urls: vec!["http://rpc1".to_string()],
            standby_rpc_urls: vec![],
            emergency_rpc_url: None,
            use_standby: false,
            multisig_address: "0xms".to_string(),
            deposit_confirmations: 10,
            withdraw_confirmations: 30,
            rank_window_secs: 300,
            endpoint_failure_threshold: 3,
            emergency_cooldown_secs: 600,
            rpc_timeout_secs: 10,
            enabled: true,
        }
    }

    fn roster_map() -> BTreeMap<String, u32> {
        BTreeMap::from([
            ("0xaaa".to_string(), 1),
            ("0xbbb".to_string(), 2),
            ("0xccc".to_string(), 3),
        ])
    }

    fn mock_roster(me: &str, rank: u32) -> MockDirectorRosterProvider {
        let mut roster = MockDirectorRosterProvider::new();
        roster.expect_is_running().return_const(true);
        roster.expect_is_director().return_const(true);
        roster.expect_node_rank().return_const(Some(rank));
        roster.expect_roster().returning(roster_map);
        roster.expect_node_address().return_const(me.to_string());
        roster.expect_home_height().return_const(1000u64);
        roster
    }

    fn good_receipt(tx_hash: H256, height: u64) -> TxReceipt {
        TxReceipt {
            tx_hash,
            block_height: Some(height),
            success: true,
            logs: vec![ReceiptLog {
                address: "0xms".to_string(),
                data: vec![1],
            }],
        }
    }

    fn deposit_entry(height: Option<u64>) -> UnconfirmedTx {
        UnconfirmedTx {
            kind: TxKind::Deposit,
            tx_hash: Some(H256::repeat_byte(0x01)),
            home_tx_hash: None,
            block_height: height,
            status: TxStatus::Initial,
            validated: false,
            skip_rounds: 0,
            height_checks: 0,
            error_count: 0,
            created_at: Utc::now().timestamp(),
            marked_deleted: false,
            delete_at_height: None,
            sent_by_local: false,
            sender: None,
            signers: Vec::new(),
            from: "0xdepositor".to_string(),
            to: "0xms".to_string(),
            value: U256::from(5_000u64),
            asset: AssetRef {
                asset_id: "9-1".to_string(),
                decimals: 18,
                is_contract: false,
                contract_address: None,
            },
            home_address: "NSEhome".to_string(),
            fee: U256::zero(),
        }
    }

    fn withdraw_entry(status: TxStatus) -> UnconfirmedTx {
        let mut entry = new_outbound_entry(TxKind::Withdraw, H256::repeat_byte(0x50), U256::zero());
        entry.status = status;
        entry.tx_hash = Some(H256::repeat_byte(0x51));
        entry.block_height = Some(100);
        entry.signers = vec!["0xaaa".to_string(), "0xbbb".to_string(), "0xccc".to_string()];
        entry
    }

    struct Fixture {
        coordinator: ConfirmationCoordinator,
        broadcast: Arc<BroadcastOrderCoordinator>,
        ledger: Arc<UnconfirmedTxLedger>,
        store: Arc<MemoryStore>,
    }

    fn fixture(
        rpc: MockChainRpcClient,
        home: MockHomeChainCallback,
        roster: MockDirectorRosterProvider,
    ) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let client: Arc<dyn ChainRpcClient> = Arc::new(rpc);
        let endpoints = Arc::new(RpcEndpointManager::new(
            &chain_config(),
            &FixedFactory(client),
        ));
        let ledger = Arc::new(UnconfirmedTxLedger::new("testnet", store.clone()));
        let home: Arc<dyn HomeChainCallback> = Arc::new(home);
        let roster: Arc<dyn DirectorRosterProvider> = Arc::new(roster);
        let traits_: Arc<dyn crate::chain::ChainTraits> = Arc::new(TestTraits::new("testnet"));

        let mut signer = MockTxSigner::new();
        signer.expect_address().return_const("0xbbb".to_string());
        signer.expect_sign().returning(|_| Ok(vec![0xab]));
        let signer: Arc<dyn crate::chain::TxSigner> = Arc::new(signer);

        let broadcast = Arc::new(BroadcastOrderCoordinator::new(
            "testnet",
            store.clone(),
            endpoints.clone(),
            traits_.clone(),
            signer.clone(),
            ledger.clone(),
            home.clone(),
            roster.clone(),
            "0xms".to_string(),
            Duration::from_secs(300),
            3,
            20,
        ));
        let gas = Arc::new(GasAccelerator::new(
            "testnet",
            endpoints.clone(),
            traits_.clone(),
            signer,
            ledger.clone(),
            Arc::new(MockPriceFeed::new()),
            "0xms".to_string(),
        ));
        let coordinator = ConfirmationCoordinator::new(
            "testnet",
            store.clone(),
            endpoints,
            ledger.clone(),
            broadcast.clone(),
            gas,
            home,
            roster,
            "0xms".to_string(),
            10,
            30,
            5,
            3,
        );
        Fixture {
            coordinator,
            broadcast,
            ledger,
            store,
        }
    }

    #[tokio::test]
    async fn test_deposit_relayed_and_removed() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));
        rpc.expect_receipt()
            .returning(|h| Ok(Some(good_receipt(h, 100))));

        let mut home = MockHomeChainCallback::new();
        home.expect_submit_deposit()
            .times(1)
            .returning(|_| Ok(H256::repeat_byte(0x99)));

        let fx = fixture(rpc, home, mock_roster("0xbbb", 2));
        fx.ledger.insert(deposit_entry(Some(100))).await.unwrap();

        fx.coordinator.tick().await.unwrap();

        assert!(fx
            .ledger
            .get(&hex::encode(H256::repeat_byte(0x01).as_bytes()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_deposit_duplicate_treated_as_done() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));
        rpc.expect_receipt()
            .returning(|h| Ok(Some(good_receipt(h, 100))));

        let mut home = MockHomeChainCallback::new();
        home.expect_submit_deposit()
            .returning(|_| Err(HomeChainError::Duplicate));

        let fx = fixture(rpc, home, mock_roster("0xbbb", 2));
        fx.ledger.insert(deposit_entry(Some(100))).await.unwrap();

        fx.coordinator.tick().await.unwrap();

        // Removed from the queue, not escalated
        assert!(fx
            .ledger
            .get(&hex::encode(H256::repeat_byte(0x01).as_bytes()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_deposit_below_depth_waits() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(105));

        // No receipt and no home expectations: neither may be touched
        let fx = fixture(rpc, MockHomeChainCallback::new(), mock_roster("0xbbb", 2));
        fx.ledger.insert(deposit_entry(Some(100))).await.unwrap();

        fx.coordinator.tick().await.unwrap();

        assert!(fx
            .ledger
            .get(&hex::encode(H256::repeat_byte(0x01).as_bytes()))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_deposit_failed_validation_marked_deleted() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));
        rpc.expect_receipt().returning(|h| {
            Ok(Some(TxReceipt {
                tx_hash: h,
                block_height: Some(100),
                success: false,
                logs: Vec::new(),
            }))
        });

        let fx = fixture(rpc, MockHomeChainCallback::new(), mock_roster("0xbbb", 2));
        fx.ledger.insert(deposit_entry(Some(100))).await.unwrap();

        fx.coordinator.tick().await.unwrap();

        let entry = fx
            .ledger
            .get(&hex::encode(H256::repeat_byte(0x01).as_bytes()))
            .await
            .unwrap();
        assert!(entry.marked_deleted);
        assert_eq!(entry.delete_at_height, Some(1100));
    }

    #[tokio::test]
    async fn test_deleted_entry_purged_after_window_never_surfaced() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));

        // Home callback has no expectations: surfacing the deleted entry
        // would panic the test
        let fx = fixture(rpc, MockHomeChainCallback::new(), mock_roster("0xbbb", 2));
        let mut entry = deposit_entry(Some(100));
        entry.mark_deleted(500); // home height 1000 is already past
        fx.ledger.insert(entry).await.unwrap();

        fx.coordinator.tick().await.unwrap();

        assert!(fx
            .ledger
            .get(&hex::encode(H256::repeat_byte(0x01).as_bytes()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_deleted_entry_retained_inside_window() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));

        let fx = fixture(rpc, MockHomeChainCallback::new(), mock_roster("0xbbb", 2));
        let mut entry = deposit_entry(Some(100));
        entry.mark_deleted(2000);
        fx.ledger.insert(entry).await.unwrap();

        fx.coordinator.tick().await.unwrap();

        assert!(fx
            .ledger
            .get(&hex::encode(H256::repeat_byte(0x01).as_bytes()))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_recovery_purges_change_entries() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));

        let fx = fixture(rpc, MockHomeChainCallback::new(), mock_roster("0xbbb", 2));
        fx.ledger
            .insert(new_outbound_entry(TxKind::Change, H256::repeat_byte(0x60), U256::zero()))
            .await
            .unwrap();
        let recovery = new_outbound_entry(TxKind::Recovery, H256::repeat_byte(0x61), U256::zero());
        fx.ledger.insert(recovery).await.unwrap();

        fx.coordinator.tick().await.unwrap();

        assert!(fx
            .ledger
            .get(&hex::encode(H256::repeat_byte(0x60).as_bytes()))
            .await
            .is_none());
        assert!(fx
            .ledger
            .get(&hex::encode(H256::repeat_byte(0x61).as_bytes()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_poison_entry_dropped() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));

        let fx = fixture(rpc, MockHomeChainCallback::new(), mock_roster("0xbbb", 2));
        let mut entry = deposit_entry(Some(100));
        entry.error_count = 6;
        fx.ledger.insert(entry).await.unwrap();

        fx.coordinator.tick().await.unwrap();

        assert!(fx
            .ledger
            .get(&hex::encode(H256::repeat_byte(0x01).as_bytes()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_completed_receipt_ok_then_confirmed_home() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));
        rpc.expect_receipt()
            .returning(|h| Ok(Some(good_receipt(h, 100))));

        let mut home = MockHomeChainCallback::new();
        home.expect_confirm_broadcast()
            .times(1)
            .returning(|_| Ok(H256::repeat_byte(0x98)));

        let fx = fixture(rpc, home, mock_roster("0xbbb", 2));
        fx.ledger.insert(withdraw_entry(TxStatus::Completed)).await.unwrap();
        let key = hex::encode(H256::repeat_byte(0x50).as_bytes());

        // Tick 1 validates the receipt and sets the cooldown
        fx.coordinator.tick().await.unwrap();
        let entry = fx.ledger.get(&key).await.unwrap();
        assert!(entry.validated);
        assert_eq!(entry.skip_rounds, REVALIDATION_SKIP_ROUNDS);

        // Cooldown rounds pass, then the confirmation goes home
        fx.coordinator.tick().await.unwrap();
        fx.coordinator.tick().await.unwrap();
        fx.coordinator.tick().await.unwrap();

        assert!(fx.ledger.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_completed_missing_receipt_times_out_to_failed() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));
        rpc.expect_receipt().returning(|_| Ok(None));

        let fx = fixture(rpc, MockHomeChainCallback::new(), mock_roster("0xbbb", 2));
        let mut entry = withdraw_entry(TxStatus::Completed);
        entry.created_at = Utc::now().timestamp() - 1260; // 21 minutes
        fx.ledger.insert(entry).await.unwrap();

        fx.coordinator.tick().await.unwrap();

        let entry = fx
            .ledger
            .get(&hex::encode(H256::repeat_byte(0x50).as_bytes()))
            .await
            .unwrap();
        assert_eq!(entry.status, TxStatus::Failed);
    }

    #[tokio::test]
    async fn test_completed_unsuccessful_receipt_marks_failed() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));
        rpc.expect_receipt().returning(|h| {
            Ok(Some(TxReceipt {
                tx_hash: h,
                block_height: Some(100),
                success: false,
                logs: Vec::new(),
            }))
        });

        let fx = fixture(rpc, MockHomeChainCallback::new(), mock_roster("0xbbb", 2));
        fx.ledger.insert(withdraw_entry(TxStatus::Completed)).await.unwrap();

        fx.coordinator.tick().await.unwrap();

        let entry = fx
            .ledger
            .get(&hex::encode(H256::repeat_byte(0x50).as_bytes()))
            .await
            .unwrap();
        assert_eq!(entry.status, TxStatus::Failed);
    }

    #[tokio::test]
    async fn test_failed_successor_resends() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));
        rpc.expect_nonce().returning(|_, _| Ok(3));
        rpc.expect_network_gas_price()
            .returning(|| Ok(U256::from(5_000_000_000u64)));
        rpc.expect_send_raw_transaction()
            .times(1)
            .returning(|_| Ok(H256::repeat_byte(0xee)));

        let mut home = MockHomeChainCallback::new();
        home.expect_broadcast_confirmed().returning(|_| Ok(false));

        let fx = fixture(rpc, home, mock_roster("0xbbb", 2));
        let home_hash = H256::repeat_byte(0x50);
        fx.broadcast
            .register(TxKind::Withdraw, home_hash, vec![7], U256::zero())
            .await
            .unwrap();

        // The rank-1 director's broadcast failed on-chain
        let mut entry = withdraw_entry(TxStatus::Failed);
        entry.sender = Some("0xaaa".to_string());
        fx.ledger.update(&entry).await.unwrap();

        fx.coordinator.tick().await.unwrap();

        let fresh = fx
            .ledger
            .get(&hex::encode(home_hash.as_bytes()))
            .await
            .unwrap();
        assert_eq!(fresh.status, TxStatus::Completed);
        assert_eq!(fresh.tx_hash, Some(H256::repeat_byte(0xee)));
        assert!(fresh.sent_by_local);
    }

    #[tokio::test]
    async fn test_failed_not_our_turn_dropped() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));

        let mut home = MockHomeChainCallback::new();
        home.expect_broadcast_confirmed().returning(|_| Ok(false));

        // This node is rank 3; the failed sender was rank 1
        let fx = fixture(rpc, home, mock_roster("0xccc", 3));
        let home_hash = H256::repeat_byte(0x50);
        fx.broadcast
            .register(TxKind::Withdraw, home_hash, vec![7], U256::zero())
            .await
            .unwrap();

        let mut entry = withdraw_entry(TxStatus::Failed);
        entry.sender = Some("0xaaa".to_string());
        fx.ledger.update(&entry).await.unwrap();

        fx.coordinator.tick().await.unwrap();

        assert!(fx.ledger.get(&hex::encode(home_hash.as_bytes())).await.is_none());
    }

    #[tokio::test]
    async fn test_height_unknown_reconciles_from_store() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));

        let fx = fixture(rpc, MockHomeChainCallback::new(), mock_roster("0xbbb", 2));
        let entry = deposit_entry(None);
        let key = entry.record_key();
        fx.ledger.insert(entry.clone()).await.unwrap();

        // Another component persisted the observed height
        let mut stored = entry;
        stored.block_height = Some(120);
        fx.store
            .put(&format!("utx/testnet/{}", key), encode(&stored).unwrap())
            .await
            .unwrap();

        fx.coordinator.tick().await.unwrap();

        let entry = fx.ledger.get(&key).await.unwrap();
        assert_eq!(entry.block_height, Some(120));
    }

    #[tokio::test]
    async fn test_overdue_entry_processed_elsewhere_dropped() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));
        rpc.expect_transaction().returning(|h| {
            Ok(Some(TxInfo {
                hash: h,
                block_height: Some(90),
                from: "0xdepositor".to_string(),
                to: Some("0xms".to_string()),
                value: U256::zero(),
            }))
        });

        let fx = fixture(rpc, MockHomeChainCallback::new(), mock_roster("0xbbb", 2));
        // The scanner is already past block 90
        fx.store
            .put(
                "tip/testnet",
                encode(&ChainTipHeader {
                    height: 100,
                    hash: H256::repeat_byte(0xaa),
                })
                .unwrap(),
            )
            .await
            .unwrap();

        let mut entry = deposit_entry(None);
        entry.height_checks = HEIGHT_CHECK_LIMIT; // next check crosses the limit
        let key = entry.record_key();
        fx.ledger.insert(entry).await.unwrap();

        fx.coordinator.tick().await.unwrap();

        assert!(fx.ledger.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_stuck_local_broadcast_triggers_acceleration() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));
        // Never packed into a block
        rpc.expect_transaction().returning(|_| Ok(None));
        // Acceleration path: completion probe says not done, then replacement
        rpc.expect_call().returning(|_, _, _| Ok(vec![0]));
        rpc.expect_network_gas_price()
            .returning(|| Ok(U256::from(10_000_000_000u64)));
        rpc.expect_estimate_gas()
            .returning(|_, _, _, _| Ok(U256::from(100_000u64)));
        rpc.expect_send_raw_transaction()
            .times(1)
            .returning(|_| Ok(H256::repeat_byte(0xbe)));

        let fx = fixture(rpc, MockHomeChainCallback::new(), mock_roster("0xbbb", 2));
        let mut entry = withdraw_entry(TxStatus::Completed);
        entry.kind = TxKind::Change; // price formula not under test here
        entry.block_height = None;
        entry.sent_by_local = true;
        entry.created_at = Utc::now().timestamp() - 300;
        let key = entry.record_key();
        fx.ledger.insert(entry.clone()).await.unwrap();
        fx.ledger
            .record_sent(&SentTransactionRecord {
                tx_hash: entry.tx_hash.unwrap(),
                from: "0xbbb".to_string(),
                nonce: 4,
                gas_price: U256::from(5_000_000_000u64),
                gas_limit: U256::from(300_000u64),
                to: "0xms".to_string(),
                data: vec![7],
                value: U256::zero(),
                sent_at: entry.created_at,
            })
            .await
            .unwrap();

        fx.coordinator.tick().await.unwrap();

        let fresh = fx.ledger.get(&key).await.unwrap();
        assert_eq!(fresh.tx_hash, Some(H256::repeat_byte(0xbe)));
        assert_eq!(fresh.height_checks, 0);
    }
}
