//! Unconfirmed-transaction records and the per-chain ledger
//!
//! The ledger pairs a persisted copy of every record with an in-memory FIFO
//! of record keys. The store is the source of truth; the queue only orders
//! the work. Drains operate on a snapshot of the queue length so re-enqueued
//! entries are not revisited within the same tick.

use crate::error::EngineResult;
use crate::store::{decode, encode, PersistentStore};

use chrono::Utc;
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Transaction classes tracked by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    Deposit,
    Withdraw,
    Change,
    Upgrade,
    Recovery,
}

impl TxKind {
    /// Home-chain-originated actions that this bridge must broadcast
    pub fn is_outbound(&self) -> bool {
        matches!(self, TxKind::Withdraw | TxKind::Change | TxKind::Upgrade)
    }
}

/// Broadcast lifecycle of an outbound entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Initial,
    Failed,
    Completed,
}

/// Asset identity carried by deposit entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRef {
    pub asset_id: String,
    pub decimals: u8,
    pub is_contract: bool,
    pub contract_address: Option<String>,
}

/// One transaction awaiting confirmation depth and validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnconfirmedTx {
    pub kind: TxKind,
    /// External tx hash; unknown for outbound entries until broadcast
    pub tx_hash: Option<H256>,
    /// Home tx hash; set for outbound entries and relayed deposits
    pub home_tx_hash: Option<H256>,
    /// Set once observed in a block; never decreases implicitly
    pub block_height: Option<u64>,
    pub status: TxStatus,
    pub validated: bool,
    /// Cooldown rounds after a revalidation request
    pub skip_rounds: u32,
    /// Cycles spent waiting for the block height to become known
    pub height_checks: u32,
    /// Consecutive callback errors
    pub error_count: u32,
    pub created_at: i64,
    pub marked_deleted: bool,
    /// Home height past which the record may be physically purged
    pub delete_at_height: Option<u64>,
    /// Whether this node broadcast the current external tx
    pub sent_by_local: bool,
    /// Address that broadcast the current external tx, when known
    pub sender: Option<String>,
    pub signers: Vec<String>,
    pub from: String,
    pub to: String,
    pub value: U256,
    pub asset: AssetRef,
    /// Home-chain address credited for deposits
    pub home_address: String,
    /// Withdrawal fee in home fee units, zero for other kinds
    pub fee: U256,
}

impl UnconfirmedTx {
    /// Deposits are keyed by external hash; outbound actions by home hash,
    /// which stays stable across resends
    pub fn record_key(&self) -> String {
        if self.kind.is_outbound() || self.kind == TxKind::Recovery {
            self.home_tx_hash
                .map(|h| hex::encode(h.as_bytes()))
                .unwrap_or_default()
        } else {
            self.tx_hash
                .map(|h| hex::encode(h.as_bytes()))
                .unwrap_or_default()
        }
    }

    /// Record the block height the tx was observed at; an already-known
    /// height is kept
    pub fn observe_height(&mut self, height: u64) {
        if self.block_height.is_none() {
            self.block_height = Some(height);
        }
    }

    pub fn mark_deleted(&mut self, purge_after_home_height: u64) {
        self.marked_deleted = true;
        self.delete_at_height = Some(purge_after_home_height);
    }
}

/// A transaction this node broadcast, kept to support acceleration.
/// Superseded (not mutated) on resend: the replacement writes a new record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentTransactionRecord {
    pub tx_hash: H256,
    pub from: String,
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: U256,
    pub to: String,
    pub data: Vec<u8>,
    pub value: U256,
    pub sent_at: i64,
}

/// One event of interest produced by the per-type block analyzer
#[derive(Debug, Clone)]
pub struct ObservedEvent {
    pub kind: TxKind,
    pub tx_hash: H256,
    pub home_tx_hash: Option<H256>,
    pub height: u64,
    pub time: i64,
    pub from: String,
    pub to: String,
    pub value: U256,
    pub asset: AssetRef,
    pub home_address: String,
    pub signers: Vec<String>,
    /// Sender of the observed external tx (used to attribute broadcasts)
    pub sender: Option<String>,
}

fn utx_key(chain: &str, record_key: &str) -> String {
    format!("utx/{}/{}", chain, record_key)
}

fn sent_key(chain: &str, tx_hash: &H256) -> String {
    format!("sent/{}/{}", chain, hex::encode(tx_hash.as_bytes()))
}

/// Persistent + in-memory queue of unconfirmed transactions for one chain
pub struct UnconfirmedTxLedger {
    chain: String,
    store: Arc<dyn PersistentStore>,
    records: RwLock<HashMap<String, UnconfirmedTx>>,
    queue: Mutex<VecDeque<String>>,
}

impl UnconfirmedTxLedger {
    pub fn new(chain: &str, store: Arc<dyn PersistentStore>) -> Self {
        Self {
            chain: chain.to_string(),
            store,
            records: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Rebuild the in-memory queue from the store on startup
    pub async fn load(&self) -> EngineResult<()> {
        let prefix = utx_key(&self.chain, "");
        let entries = self.store.scan_prefix(&prefix).await?;
        let mut records = self.records.write().await;
        let mut queue = self.queue.lock().await;
        for (key, bytes) in entries {
            match decode::<UnconfirmedTx>(&key, &bytes) {
                Ok(record) => {
                    let rk = record.record_key();
                    queue.push_back(rk.clone());
                    records.insert(rk, record);
                }
                Err(e) => warn!("Skipping corrupt ledger record: {}", e),
            }
        }
        debug!("Chain {}: loaded {} unconfirmed entries", self.chain, queue.len());
        Ok(())
    }

    /// Number of entries queued right now; drains snapshot this once per tick
    pub async fn snapshot_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Pop the next queued record, skipping keys removed since enqueueing
    pub async fn pop(&self) -> Option<UnconfirmedTx> {
        let mut queue = self.queue.lock().await;
        let records = self.records.read().await;
        while let Some(key) = queue.pop_front() {
            if let Some(record) = records.get(&key) {
                return Some(record.clone());
            }
        }
        None
    }

    /// Persist the record and put it back at the tail of the queue
    pub async fn requeue(&self, record: UnconfirmedTx) -> EngineResult<()> {
        let key = record.record_key();
        self.persist(&record).await?;
        self.records.write().await.insert(key.clone(), record);
        self.queue.lock().await.push_back(key);
        Ok(())
    }

    /// Insert a new record if absent; enqueues it for the coordinator
    pub async fn insert(&self, record: UnconfirmedTx) -> EngineResult<bool> {
        let key = record.record_key();
        {
            let records = self.records.read().await;
            if records.contains_key(&key) {
                return Ok(false);
            }
        }
        self.persist(&record).await?;
        self.records.write().await.insert(key.clone(), record);
        self.queue.lock().await.push_back(key);
        Ok(true)
    }

    /// Persist a mutated record and refresh the cached copy without
    /// re-enqueueing it
    pub async fn update(&self, record: &UnconfirmedTx) -> EngineResult<()> {
        self.persist(record).await?;
        self.records
            .write()
            .await
            .insert(record.record_key(), record.clone());
        Ok(())
    }

    async fn persist(&self, record: &UnconfirmedTx) -> EngineResult<()> {
        let key = utx_key(&self.chain, &record.record_key());
        self.store.put(&key, encode(record)?).await
    }

    pub async fn get(&self, record_key: &str) -> Option<UnconfirmedTx> {
        self.records.read().await.get(record_key).cloned()
    }

    /// Reload the persisted copy; the store is the source of truth when the
    /// cached entry is missing a critical field
    pub async fn reconcile(&self, record: &UnconfirmedTx) -> EngineResult<Option<UnconfirmedTx>> {
        let key = utx_key(&self.chain, &record.record_key());
        match self.store.get(&key).await? {
            Some(bytes) => Ok(Some(decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Drop a record from queue, cache and store
    pub async fn remove(&self, record_key: &str) -> EngineResult<()> {
        self.records.write().await.remove(record_key);
        self.store.delete(&utx_key(&self.chain, record_key)).await
    }

    /// Apply analyzer output: create missing entries, attach block heights
    /// to known ones
    pub async fn observe(&self, events: Vec<ObservedEvent>) -> EngineResult<()> {
        for event in events {
            let record_key = if event.kind.is_outbound() || event.kind == TxKind::Recovery {
                event
                    .home_tx_hash
                    .map(|h| hex::encode(h.as_bytes()))
                    .unwrap_or_default()
            } else {
                hex::encode(event.tx_hash.as_bytes())
            };

            if let Some(mut existing) = self.get(&record_key).await {
                existing.observe_height(event.height);
                if existing.kind.is_outbound() {
                    // The broadcast may have been sent by another director
                    existing.tx_hash = Some(event.tx_hash);
                    if existing.sender.is_none() {
                        existing.sender = event.sender.clone();
                    }
                }
                self.update(&existing).await?;
                continue;
            }

            let record = UnconfirmedTx {
                kind: event.kind,
                tx_hash: Some(event.tx_hash),
                home_tx_hash: event.home_tx_hash,
                block_height: Some(event.height),
                status: if event.kind.is_outbound() {
                    TxStatus::Completed
                } else {
                    TxStatus::Initial
                },
                validated: false,
                skip_rounds: 0,
                height_checks: 0,
                error_count: 0,
                created_at: event.time,
                marked_deleted: false,
                delete_at_height: None,
                sent_by_local: false,
                sender: event.sender,
                signers: event.signers,
                from: event.from,
                to: event.to,
                value: event.value,
                asset: event.asset,
                home_address: event.home_address,
                fee: U256::zero(),
            };
            self.insert(record).await?;
        }
        Ok(())
    }

    /// Revert entries produced at or above a fork height. Unvalidated
    /// deposits are removed outright; outbound entries keep their identity
    /// but forget the now-invalid observation.
    pub async fn rollback_above(&self, height: u64) -> EngineResult<usize> {
        let snapshot: Vec<UnconfirmedTx> =
            self.records.read().await.values().cloned().collect();
        let mut reverted = 0;

        for mut record in snapshot {
            let Some(h) = record.block_height else { continue };
            if h < height || record.validated {
                continue;
            }
            if record.kind == TxKind::Deposit {
                self.remove(&record.record_key()).await?;
                reverted += 1;
            } else if record.kind.is_outbound() {
                record.block_height = None;
                record.height_checks = 0;
                self.update(&record).await?;
                reverted += 1;
            }
        }

        if reverted > 0 {
            warn!(
                "Chain {}: reverted {} unconfirmed entries above fork height {}",
                self.chain, reverted, height
            );
        }
        Ok(reverted)
    }

    /// Remove every queued entry of the given kind
    pub async fn purge_kind(&self, kind: TxKind) -> EngineResult<usize> {
        let keys: Vec<String> = self
            .records
            .read()
            .await
            .iter()
            .filter(|(_, r)| r.kind == kind)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            self.remove(key).await?;
        }
        Ok(keys.len())
    }

    /// Record a transaction broadcast by this node
    pub async fn record_sent(&self, record: &SentTransactionRecord) -> EngineResult<()> {
        let key = sent_key(&self.chain, &record.tx_hash);
        self.store.put(&key, encode(record)?).await
    }

    pub async fn sent_record(&self, tx_hash: &H256) -> EngineResult<Option<SentTransactionRecord>> {
        let key = sent_key(&self.chain, tx_hash);
        match self.store.get(&key).await? {
            Some(bytes) => Ok(Some(decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }
}

/// Build a fresh outbound entry awaiting broadcast
pub fn new_outbound_entry(kind: TxKind, home_tx_hash: H256, fee: U256) -> UnconfirmedTx {
    UnconfirmedTx {
        kind,
        tx_hash: None,
        home_tx_hash: Some(home_tx_hash),
        block_height: None,
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
        from: String::new(),
        to: String::new(),
        value: U256::zero(),
        asset: AssetRef {
            asset_id: String::new(),
            decimals: 0,
            is_contract: false,
            contract_address: None,
        },
        home_address: String::new(),
        fee,
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;

    pub fn deposit_event(tx_hash: H256, height: u64) -> ObservedEvent {
        ObservedEvent {
            kind: TxKind::Deposit,
            tx_hash,
            home_tx_hash: None,
            height,
            time: 1_700_000_000,
            from: "0x1111111111111111111111111111111111111111".to_string(),
            to: "0x2222222222222222222222222222222222222222".to_string(),
            value: U256::from(1_000_000u64),
            asset: AssetRef {
                asset_id: "1-1".to_string(),
                decimals: 18,
                is_contract: false,
                contract_address: None,
            },
            home_address: "NSEhome".to_string(),
            signers: Vec::new(),
            sender: None,
        }
    }
}
