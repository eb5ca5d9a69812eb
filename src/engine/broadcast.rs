//! Rank-ordered broadcast coordination for outbound multi-sig actions
//!
//! Directors take turns broadcasting a pending action: rank 1 sends
//! immediately, every later rank inherits the send after its waiting window
//! elapses without success. When every window has elapsed the rotation
//! restarts from rank 1 with the bookkeeping cleared. Exactly one node sends
//! per round under normal operation, with no coordination traffic between
//! the directors.

use crate::chain::rpc::NonceKind;
use crate::chain::{ChainTraits, RpcEndpointManager, TxPlan, TxSigner};
use crate::engine::ledger::{
    new_outbound_entry, SentTransactionRecord, TxKind, TxStatus, UnconfirmedTxLedger,
};
use crate::error::{EngineError, EngineResult};
use crate::home::{DirectorRosterProvider, HomeChainCallback};
use crate::store::{decode, encode, PersistentStore};

use chrono::Utc;
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// One pending outbound multi-sig action awaiting its broadcast turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitingBroadcast {
    pub home_tx_hash: H256,
    pub kind: TxKind,
    /// Pre-encoded multi-sig call data assembled by the home chain
    pub payload: Vec<u8>,
    /// Director address -> broadcast rank (1-based)
    pub signers: BTreeMap<String, u32>,
    pub node_rank: u32,
    /// When this node's turn arrives
    pub waiting_end: i64,
    /// When every director's window has elapsed
    pub max_waiting_end: i64,
    /// Home height at which the contract is probed for completion
    pub validate_height: Option<u64>,
    /// Directors known to have sent in the current round
    pub already_sent: BTreeSet<String>,
    pub resend_count: u32,
    /// Withdrawal fee in home fee units, for gas acceleration
    pub fee: U256,
}

fn wbc_key(chain: &str, home_tx_hash: &H256) -> String {
    format!("wbc/{}/{}", chain, hex::encode(home_tx_hash.as_bytes()))
}

enum Disposition {
    Keep,
    Drop,
}

pub struct BroadcastOrderCoordinator {
    chain: String,
    store: Arc<dyn PersistentStore>,
    endpoints: Arc<RpcEndpointManager>,
    traits_: Arc<dyn ChainTraits>,
    signer: Arc<dyn TxSigner>,
    ledger: Arc<UnconfirmedTxLedger>,
    home: Arc<dyn HomeChainCallback>,
    roster: Arc<dyn DirectorRosterProvider>,
    records: RwLock<HashMap<H256, WaitingBroadcast>>,
    queue: Mutex<VecDeque<H256>>,
    multisig_address: String,
    rank_window: Duration,
    resend_limit: u32,
    contract_check_blocks: u64,
}

impl BroadcastOrderCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: &str,
        store: Arc<dyn PersistentStore>,
        endpoints: Arc<RpcEndpointManager>,
        traits_: Arc<dyn ChainTraits>,
        signer: Arc<dyn TxSigner>,
        ledger: Arc<UnconfirmedTxLedger>,
        home: Arc<dyn HomeChainCallback>,
        roster: Arc<dyn DirectorRosterProvider>,
        multisig_address: String,
        rank_window: Duration,
        resend_limit: u32,
        contract_check_blocks: u64,
    ) -> Self {
        Self {
            chain: chain.to_string(),
            store,
            endpoints,
            traits_,
            signer,
            ledger,
            home,
            roster,
            records: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            multisig_address,
            rank_window,
            resend_limit,
            contract_check_blocks,
        }
    }

    /// Rebuild the waiting queue from the store on startup
    pub async fn load(&self) -> EngineResult<()> {
        let prefix = format!("wbc/{}/", self.chain);
        let entries = self.store.scan_prefix(&prefix).await?;
        let mut records = self.records.write().await;
        let mut queue = self.queue.lock().await;
        for (key, bytes) in entries {
            match decode::<WaitingBroadcast>(&key, &bytes) {
                Ok(w) => {
                    queue.push_back(w.home_tx_hash);
                    records.insert(w.home_tx_hash, w);
                }
                Err(e) => warn!("Skipping corrupt waiting record: {}", e),
            }
        }
        Ok(())
    }

    /// The node learned it must help broadcast a home-chain action
    pub async fn register(
        &self,
        kind: TxKind,
        home_tx_hash: H256,
        payload: Vec<u8>,
        fee: U256,
    ) -> EngineResult<()> {
        if self.records.read().await.contains_key(&home_tx_hash) {
            return Ok(());
        }

        let signers = self.roster.roster();
        let node_rank = self.roster.node_rank().unwrap_or(u32::MAX);
        let now = Utc::now().timestamp();
        let window = self.rank_window.as_secs() as i64;
        let mut waiting = WaitingBroadcast {
            home_tx_hash,
            kind,
            payload,
            signers: signers.clone(),
            node_rank,
            waiting_end: now + window * i64::from(node_rank.saturating_sub(1)),
            max_waiting_end: now + window * signers.len() as i64,
            validate_height: Some(self.roster.home_height() + self.contract_check_blocks),
            already_sent: BTreeSet::new(),
            resend_count: 0,
            fee,
        };

        let mut entry = new_outbound_entry(kind, home_tx_hash, fee);
        entry.signers = signers.keys().cloned().collect();
        entry.to = self.multisig_address.clone();
        self.ledger.insert(entry).await?;

        if node_rank == 1 {
            self.broadcast(&mut waiting).await?;
        }

        self.persist(&waiting).await?;
        self.records.write().await.insert(home_tx_hash, waiting);
        self.queue.lock().await.push_back(home_tx_hash);
        crate::metrics::record_waiting_depth(&self.chain, self.records.read().await.len());
        Ok(())
    }

    /// One coordination cycle over a snapshot of the waiting queue
    pub async fn tick(&self) -> EngineResult<()> {
        if !self.roster.is_running() || !self.roster.is_director() {
            return Ok(());
        }

        let n = self.queue.lock().await.len();
        for _ in 0..n {
            let Some(home_tx_hash) = self.next().await else { break };
            let Some(mut waiting) = self.get(&home_tx_hash).await else {
                continue;
            };
            match self.process(&mut waiting).await {
                Ok(Disposition::Drop) => self.purge(&home_tx_hash).await?,
                Ok(Disposition::Keep) => self.requeue(waiting).await?,
                Err(e) => {
                    warn!(
                        "Chain {}: waiting {} errored: {}",
                        self.chain,
                        hex::encode(home_tx_hash.as_bytes()),
                        e
                    );
                    self.requeue(waiting).await?;
                }
            }
        }
        crate::metrics::record_waiting_depth(&self.chain, self.records.read().await.len());
        Ok(())
    }

    async fn process(&self, waiting: &mut WaitingBroadcast) -> EngineResult<Disposition> {
        // Confirmed at home by some director's broadcast; nothing left to do
        if self.home.broadcast_confirmed(waiting.home_tx_hash).await? {
            debug!(
                "Chain {}: {} confirmed at home, dropping waiting record",
                self.chain,
                hex::encode(waiting.home_tx_hash.as_bytes())
            );
            return Ok(Disposition::Drop);
        }

        // Periodic direct probe of the multi-sig contract
        let home_height = self.roster.home_height();
        if let Some(validate_at) = waiting.validate_height {
            if home_height >= validate_at {
                if self.contract_completed(&waiting.home_tx_hash).await? {
                    info!(
                        "Chain {}: contract reports {} complete",
                        self.chain,
                        hex::encode(waiting.home_tx_hash.as_bytes())
                    );
                    return Ok(Disposition::Drop);
                }
                waiting.validate_height = Some(home_height + self.contract_check_blocks);
            }
        }

        if waiting.resend_count > self.resend_limit {
            warn!(
                "Chain {}: resend budget exhausted for {}",
                self.chain,
                hex::encode(waiting.home_tx_hash.as_bytes())
            );
            return Ok(Disposition::Drop);
        }

        let now = Utc::now().timestamp();
        let me = self.roster.node_address();

        if now >= waiting.waiting_end
            && waiting.node_rank != 1
            && !waiting.already_sent.contains(&me)
        {
            // Earlier ranks had their window and did not act
            self.broadcast(waiting).await?;
            return Ok(Disposition::Keep);
        }

        if now >= waiting.max_waiting_end {
            // Every director's window elapsed with no success; restart the
            // rotation from rank 1
            waiting.already_sent.clear();
            waiting.resend_count += 1;
            let window = self.rank_window.as_secs() as i64;
            waiting.waiting_end =
                now + window * i64::from(waiting.node_rank.saturating_sub(1));
            waiting.max_waiting_end = now + window * waiting.signers.len() as i64;
            if waiting.node_rank == 1 {
                self.broadcast(waiting).await?;
                return Ok(Disposition::Drop);
            }
        }

        Ok(Disposition::Keep)
    }

    /// Compose, sign and send the multi-sig transaction, then hand the result
    /// to the unconfirmed ledger for tracking
    pub async fn broadcast(&self, waiting: &mut WaitingBroadcast) -> EngineResult<()> {
        let from = self.signer.address();
        let nonce = self
            .endpoints
            .execute(&self.chain, |c| {
                let from = from.clone();
                async move { c.nonce(&from, NonceKind::Pending).await }
            })
            .await?;
        let network_price = self
            .endpoints
            .execute(&self.chain, |c| async move { c.network_gas_price().await })
            .await?;
        let gas_price = network_price.max(self.traits_.min_gas_price());

        let plan = TxPlan {
            to: self.multisig_address.clone(),
            value: U256::zero(),
            data: waiting.payload.clone(),
            nonce,
            gas_price,
            gas_limit: self.traits_.multisig_gas_limit(),
        };
        let signed = self
            .signer
            .sign(&plan)
            .await
            .map_err(|e| EngineError::Signing(e.to_string()))?;
        let tx_hash = self
            .endpoints
            .execute(&self.chain, |c| {
                let signed = signed.clone();
                async move { c.send_raw_transaction(&signed).await }
            })
            .await?;

        info!(
            "Chain {}: broadcast {:?} for {} as {:?} (nonce {})",
            self.chain,
            waiting.kind,
            hex::encode(waiting.home_tx_hash.as_bytes()),
            tx_hash,
            nonce
        );

        waiting.already_sent.insert(from.clone());
        self.persist(waiting).await?;

        self.ledger
            .record_sent(&SentTransactionRecord {
                tx_hash,
                from: from.clone(),
                nonce,
                gas_price: plan.gas_price,
                gas_limit: plan.gas_limit,
                to: plan.to.clone(),
                data: plan.data.clone(),
                value: plan.value,
                sent_at: Utc::now().timestamp(),
            })
            .await?;

        let key = hex::encode(waiting.home_tx_hash.as_bytes());
        let existing = self.ledger.get(&key).await;
        let mut entry = existing.clone().unwrap_or_else(|| {
            let mut entry = new_outbound_entry(waiting.kind, waiting.home_tx_hash, waiting.fee);
            entry.signers = waiting.signers.keys().cloned().collect();
            entry
        });
        entry.status = TxStatus::Completed;
        entry.tx_hash = Some(tx_hash);
        entry.block_height = None;
        entry.height_checks = 0;
        entry.validated = false;
        entry.sent_by_local = true;
        entry.sender = Some(from);
        entry.to = self.multisig_address.clone();
        if existing.is_some() {
            self.ledger.update(&entry).await?;
        } else {
            self.ledger.insert(entry).await?;
        }

        crate::metrics::record_broadcast_sent(&self.chain);
        Ok(())
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

    /// Waiting record for a home tx, consulted by the confirmation
    /// coordinator's failure handling
    pub async fn waiting_for(&self, home_tx_hash: &H256) -> Option<WaitingBroadcast> {
        self.records.read().await.get(home_tx_hash).cloned()
    }

    /// Restart the rotation: forget who sent and recompute the windows
    pub async fn reset_order(&self, home_tx_hash: &H256) -> EngineResult<()> {
        let mut records = self.records.write().await;
        if let Some(waiting) = records.get_mut(home_tx_hash) {
            let now = Utc::now().timestamp();
            let window = self.rank_window.as_secs() as i64;
            waiting.already_sent.clear();
            waiting.waiting_end =
                now + window * i64::from(waiting.node_rank.saturating_sub(1));
            waiting.max_waiting_end = now + window * waiting.signers.len() as i64;
            let snapshot = waiting.clone();
            drop(records);
            self.persist(&snapshot).await?;
        }
        Ok(())
    }

    /// Re-broadcast after a failed round, counting against the resend budget
    pub async fn resend(&self, home_tx_hash: &H256) -> EngineResult<()> {
        let Some(mut waiting) = self.waiting_for(home_tx_hash).await else {
            return Ok(());
        };
        if waiting.resend_count > self.resend_limit {
            return Err(EngineError::ResendExhausted {
                key: hex::encode(home_tx_hash.as_bytes()),
            });
        }
        waiting.resend_count += 1;
        self.broadcast(&mut waiting).await?;
        self.records.write().await.insert(*home_tx_hash, waiting);
        Ok(())
    }

    pub async fn purge(&self, home_tx_hash: &H256) -> EngineResult<()> {
        self.records.write().await.remove(home_tx_hash);
        self.store
            .delete(&wbc_key(&self.chain, home_tx_hash))
            .await
    }

    async fn persist(&self, waiting: &WaitingBroadcast) -> EngineResult<()> {
        self.store
            .put(
                &wbc_key(&self.chain, &waiting.home_tx_hash),
                encode(waiting)?,
            )
            .await
    }

    async fn next(&self) -> Option<H256> {
        self.queue.lock().await.pop_front()
    }

    async fn get(&self, home_tx_hash: &H256) -> Option<WaitingBroadcast> {
        self.records.read().await.get(home_tx_hash).cloned()
    }

    async fn requeue(&self, waiting: WaitingBroadcast) -> EngineResult<()> {
        let hash = waiting.home_tx_hash;
        self.persist(&waiting).await?;
        self.records.write().await.insert(hash, waiting);
        self.queue.lock().await.push_back(hash);
        Ok(())
    }
}
