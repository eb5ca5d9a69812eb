//! Block scanner: tip advancement, fork detection, bootstrap resync
//!
//! The scanner owns the persisted chain tip and a short window of recent
//! headers used for fork rollback. Blocks are analyzed strictly in ascending
//! height order; any RPC failure aborts the cycle without losing the progress
//! already persisted.

use crate::chain::rpc::{BlockData, BlockHeader};
use crate::chain::RpcEndpointManager;
use crate::engine::ledger::{ObservedEvent, UnconfirmedTxLedger};
use crate::error::{EngineError, EngineResult};
use crate::home::DirectorRosterProvider;
use crate::store::{decode, encode, PersistentStore};

use async_trait::async_trait;
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Last locally processed block of one external chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTipHeader {
    pub height: u64,
    pub hash: H256,
}

/// Per-transaction-type block analyzer (consumed capability)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockAnalyzer: Send + Sync {
    async fn analyze(&self, block: &BlockData) -> EngineResult<Vec<ObservedEvent>>;
}

fn tip_key(chain: &str) -> String {
    format!("tip/{}", chain)
}

fn header_key(chain: &str, height: u64) -> String {
    format!("hdr/{}/{:020}", chain, height)
}

pub struct BlockScanner {
    chain: String,
    store: Arc<dyn PersistentStore>,
    endpoints: Arc<RpcEndpointManager>,
    ledger: Arc<UnconfirmedTxLedger>,
    analyzer: Arc<dyn BlockAnalyzer>,
    roster: Arc<dyn DirectorRosterProvider>,
    /// First tick since startup or since director status was regained
    resync: AtomicBool,
    /// How many recent headers to keep for fork rollback
    header_window: u64,
}

impl BlockScanner {
    pub fn new(
        chain: &str,
        store: Arc<dyn PersistentStore>,
        endpoints: Arc<RpcEndpointManager>,
        ledger: Arc<UnconfirmedTxLedger>,
        analyzer: Arc<dyn BlockAnalyzer>,
        roster: Arc<dyn DirectorRosterProvider>,
        header_window: u64,
    ) -> Self {
        Self {
            chain: chain.to_string(),
            store,
            endpoints,
            ledger,
            analyzer,
            roster,
            resync: AtomicBool::new(true),
            header_window,
        }
    }

    /// One scan cycle; every failure is logged and retried next tick
    pub async fn tick(&self) -> EngineResult<()> {
        if !self.roster.is_running() || !self.roster.is_director() {
            self.purge_local_state().await?;
            self.resync.store(true, Ordering::SeqCst);
            return Ok(());
        }

        let remote = self
            .endpoints
            .execute(&self.chain, |c| async move { c.tip_height().await })
            .await?;
        crate::metrics::record_remote_height(&self.chain, remote);

        let Some(tip) = self.load_tip().await? else {
            // Bootstrap: history before the remote tip is intentionally skipped
            return self.bootstrap(remote).await;
        };

        // After a long pause, jump to the remote tip instead of catching up
        // block-by-block
        let first_since_director = self.resync.swap(false, Ordering::SeqCst);
        if first_since_director && remote.saturating_sub(tip.height) >= 2 {
            info!(
                "Chain {}: resync jump {} -> {} after regaining director status",
                self.chain, tip.height, remote
            );
            return self.bootstrap(remote).await;
        }

        // Fork check against the stored tip before advancing
        let header = self
            .endpoints
            .execute(&self.chain, |c| {
                let h = tip.height;
                async move { c.block_header(h).await }
            })
            .await?;
        let Some(header) = header else {
            warn!(
                "Chain {}: header {} unavailable, retrying next tick",
                self.chain, tip.height
            );
            return Ok(());
        };
        if header.hash != tip.hash {
            return self.handle_fork(&tip).await;
        }

        self.scan_forward(tip.height, remote).await
    }

    async fn bootstrap(&self, remote: u64) -> EngineResult<()> {
        let block = self
            .endpoints
            .execute(&self.chain, |c| async move { c.block(remote).await })
            .await?;
        let Some(block) = block else {
            // Remote tip not servable yet; retry next tick
            return Ok(());
        };
        self.resync.store(false, Ordering::SeqCst);
        self.analyze_and_advance(&block).await
    }

    async fn scan_forward(&self, from: u64, remote: u64) -> EngineResult<()> {
        for height in (from + 1)..=remote {
            let block = match self
                .endpoints
                .execute(&self.chain, |c| async move { c.block(height).await })
                .await
            {
                Ok(Some(block)) => block,
                Ok(None) => break,
                Err(e) => {
                    // Progress up to the previous height is already persisted
                    warn!("Chain {}: fetch {} failed: {}", self.chain, height, e);
                    break;
                }
            };
            self.analyze_and_advance(&block).await?;
        }
        Ok(())
    }

    async fn analyze_and_advance(&self, block: &BlockData) -> EngineResult<()> {
        let events = self.analyzer.analyze(block).await?;
        if !events.is_empty() {
            debug!(
                "Chain {}: block {} produced {} events",
                self.chain,
                block.header.height,
                events.len()
            );
        }
        self.ledger.observe(events).await?;
        self.store_tip(&block.header).await?;
        crate::metrics::record_block_scanned(&self.chain, block.header.height);
        Ok(())
    }

    async fn handle_fork(&self, tip: &ChainTipHeader) -> EngineResult<()> {
        warn!(
            "Chain {}: fork at height {} (stored {:?})",
            self.chain, tip.height, tip.hash
        );
        crate::metrics::record_fork(&self.chain);

        self.ledger.rollback_above(tip.height).await?;
        self.store.delete(&header_key(&self.chain, tip.height)).await?;

        // Step back one height; next tick re-validates there before resuming
        let prev_key = header_key(&self.chain, tip.height.saturating_sub(1));
        match self.store.get(&prev_key).await? {
            Some(bytes) => {
                let prev: BlockHeader = decode(&prev_key, &bytes)?;
                let rolled = ChainTipHeader {
                    height: prev.height,
                    hash: prev.hash,
                };
                self.store
                    .put(&tip_key(&self.chain), encode(&rolled)?)
                    .await?;
            }
            None => {
                // Fork deeper than the stored window; degrade to a full resync
                self.purge_local_state().await?;
            }
        }

        Err(EngineError::ForkDetected {
            chain: self.chain.clone(),
            height: tip.height,
        })
    }

    async fn load_tip(&self) -> EngineResult<Option<ChainTipHeader>> {
        let key = tip_key(&self.chain);
        match self.store.get(&key).await? {
            Some(bytes) => Ok(Some(decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    async fn store_tip(&self, header: &BlockHeader) -> EngineResult<()> {
        let tip = ChainTipHeader {
            height: header.height,
            hash: header.hash,
        };
        self.store
            .put(&header_key(&self.chain, header.height), encode(header)?)
            .await?;
        self.store.put(&tip_key(&self.chain), encode(&tip)?).await?;

        if header.height > self.header_window {
            self.store
                .delete(&header_key(&self.chain, header.height - self.header_window))
                .await?;
        }
        Ok(())
    }

    /// Delete the tip and header window so a clean resync happens when
    /// director status is regained
    async fn purge_local_state(&self) -> EngineResult<()> {
        if self.load_tip().await?.is_none() {
            return Ok(());
        }
        info!("Chain {}: purging local tip for resync", self.chain);
        self.store.delete(&tip_key(&self.chain)).await?;
        let headers = self
            .store
            .scan_prefix(&format!("hdr/{}/", self.chain))
            .await?;
        for (key, _) in headers {
            self.store.delete(&key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::endpoints::RpcClientFactory;
    use crate::chain::rpc::{ChainRpcClient, MockChainRpcClient};
    use crate::config::ChainConfig;
    use crate::home::MockDirectorRosterProvider;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct FixedFactory(Arc<dyn ChainRpcClient>);

    impl RpcClientFactory for FixedFactory {
        fn connect(&self, _url: &str, _timeout: Duration) -> Arc<dyn ChainRpcClient> {
            self.0.clone()
        }
    }

    /// Analyzer stub that records which heights it saw
    struct RecordingAnalyzer {
        seen: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl BlockAnalyzer for RecordingAnalyzer {
        async fn analyze(&self, block: &BlockData) -> EngineResult<Vec<ObservedEvent>> {
            self.seen.lock().await.push(block.header.height);
            Ok(Vec::new())
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

    fn director_roster() -> MockDirectorRosterProvider {
        let mut roster = MockDirectorRosterProvider::new();
        roster.expect_is_running().return_const(true);
        roster.expect_is_director().return_const(true);
        roster
    }

    fn block_at(height: u64, hash: H256) -> BlockData {
        BlockData {
            header: BlockHeader {
                height,
                hash,
                parent_hash: H256::zero(),
                timestamp: 1_700_000_000,
            },
            tx_hashes: Vec::new(),
        }
    }

    struct Fixture {
        scanner: BlockScanner,
        store: Arc<MemoryStore>,
        analyzer: Arc<RecordingAnalyzer>,
        ledger: Arc<UnconfirmedTxLedger>,
    }

    fn fixture(rpc: MockChainRpcClient, roster: MockDirectorRosterProvider) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let client: Arc<dyn ChainRpcClient> = Arc::new(rpc);
        let endpoints = Arc::new(RpcEndpointManager::new(
            &chain_config(),
            &FixedFactory(client),
        ));
        let ledger = Arc::new(UnconfirmedTxLedger::new("testnet", store.clone()));
        let analyzer = Arc::new(RecordingAnalyzer {
            seen: Mutex::new(Vec::new()),
        });
        let scanner = BlockScanner::new(
            "testnet",
            store.clone(),
            endpoints,
            ledger.clone(),
            analyzer.clone(),
            Arc::new(roster),
            60,
        );
        Fixture {
            scanner,
            store,
            analyzer,
            ledger,
        }
    }

    async fn stored_tip(store: &MemoryStore) -> Option<ChainTipHeader> {
        store
            .get("tip/testnet")
            .await
            .unwrap()
            .map(|b| serde_json::from_slice(&b).unwrap())
    }

    #[tokio::test]
    async fn test_bootstrap_jumps_to_remote_tip() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(100));
        rpc.expect_block()
            .withf(|h| *h == 100)
            .returning(|h| Ok(Some(block_at(h, H256::repeat_byte(0xaa)))));

        let fx = fixture(rpc, director_roster());
        fx.scanner.tick().await.unwrap();

        let tip = stored_tip(&fx.store).await.unwrap();
        assert_eq!(tip.height, 100);
        assert_eq!(*fx.analyzer.seen.lock().await, vec![100]);
    }

    #[tokio::test]
    async fn test_forward_scan_advances_per_block() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(103));
        rpc.expect_block_header()
            .withf(|h| *h == 100)
            .returning(|h| {
                Ok(Some(BlockHeader {
                    height: h,
                    hash: H256::repeat_byte(0xaa),
                    parent_hash: H256::zero(),
                    timestamp: 0,
                }))
            });
        rpc.expect_block()
            .returning(|h| Ok(Some(block_at(h, H256::repeat_byte(h as u8)))));

        let fx = fixture(rpc, director_roster());
        // Seed the tip; a non-resync tick must not bootstrap
        fx.store
            .put(
                "tip/testnet",
                serde_json::to_vec(&ChainTipHeader {
                    height: 100,
                    hash: H256::repeat_byte(0xaa),
                })
                .unwrap(),
            )
            .await
            .unwrap();
        fx.scanner.resync.store(false, Ordering::SeqCst);

        fx.scanner.tick().await.unwrap();

        assert_eq!(*fx.analyzer.seen.lock().await, vec![101, 102, 103]);
        assert_eq!(stored_tip(&fx.store).await.unwrap().height, 103);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_progress() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(103));
        rpc.expect_block_header().returning(|h| {
            Ok(Some(BlockHeader {
                height: h,
                hash: H256::repeat_byte(0xaa),
                parent_hash: H256::zero(),
                timestamp: 0,
            }))
        });
        rpc.expect_block().returning(|h| {
            if h == 102 {
                Ok(None)
            } else {
                Ok(Some(block_at(h, H256::repeat_byte(h as u8))))
            }
        });

        let fx = fixture(rpc, director_roster());
        fx.store
            .put(
                "tip/testnet",
                serde_json::to_vec(&ChainTipHeader {
                    height: 100,
                    hash: H256::repeat_byte(0xaa),
                })
                .unwrap(),
            )
            .await
            .unwrap();
        fx.scanner.resync.store(false, Ordering::SeqCst);

        fx.scanner.tick().await.unwrap();

        assert_eq!(*fx.analyzer.seen.lock().await, vec![101]);
        assert_eq!(stored_tip(&fx.store).await.unwrap().height, 101);
    }

    #[tokio::test]
    async fn test_fork_rolls_back_one_height() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(100));
        // Remote disagrees about height 100
        rpc.expect_block_header().withf(|h| *h == 100).returning(|h| {
            Ok(Some(BlockHeader {
                height: h,
                hash: H256::repeat_byte(0xbb),
                parent_hash: H256::zero(),
                timestamp: 0,
            }))
        });

        let fx = fixture(rpc, director_roster());
        let stored_99 = BlockHeader {
            height: 99,
            hash: H256::repeat_byte(0x99),
            parent_hash: H256::zero(),
            timestamp: 0,
        };
        fx.store
            .put("hdr/testnet/00000000000000000099", serde_json::to_vec(&stored_99).unwrap())
            .await
            .unwrap();
        fx.store
            .put(
                "tip/testnet",
                serde_json::to_vec(&ChainTipHeader {
                    height: 100,
                    hash: H256::repeat_byte(0xaa),
                })
                .unwrap(),
            )
            .await
            .unwrap();
        // A deposit observed at the forked height must be reverted
        fx.ledger
            .observe(vec![crate::engine::ledger::testutil::deposit_event(
                H256::repeat_byte(1),
                100,
            )])
            .await
            .unwrap();
        fx.scanner.resync.store(false, Ordering::SeqCst);

        let err = fx.scanner.tick().await.unwrap_err();
        assert!(matches!(err, EngineError::ForkDetected { height: 100, .. }));

        let tip = stored_tip(&fx.store).await.unwrap();
        assert_eq!(tip.height, 99);
        assert_eq!(tip.hash, H256::repeat_byte(0x99));
        // No block at or above the fork height was analyzed
        assert!(fx.analyzer.seen.lock().await.is_empty());
        assert!(fx
            .ledger
            .get(&hex::encode(H256::repeat_byte(1).as_bytes()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_non_director_purges_tip() {
        let rpc = MockChainRpcClient::new();
        let mut roster = MockDirectorRosterProvider::new();
        roster.expect_is_running().return_const(true);
        roster.expect_is_director().return_const(false);

        let fx = fixture(rpc, roster);
        fx.store
            .put(
                "tip/testnet",
                serde_json::to_vec(&ChainTipHeader {
                    height: 100,
                    hash: H256::repeat_byte(0xaa),
                })
                .unwrap(),
            )
            .await
            .unwrap();

        fx.scanner.tick().await.unwrap();
        assert!(stored_tip(&fx.store).await.is_none());
        assert!(fx.scanner.resync.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_resync_jump_skips_intermediate_history() {
        let mut rpc = MockChainRpcClient::new();
        rpc.expect_tip_height().returning(|| Ok(200));
        rpc.expect_block()
            .withf(|h| *h == 200)
            .returning(|h| Ok(Some(block_at(h, H256::repeat_byte(0xcc)))));

        let fx = fixture(rpc, director_roster());
        fx.store
            .put(
                "tip/testnet",
                serde_json::to_vec(&ChainTipHeader {
                    height: 100,
                    hash: H256::repeat_byte(0xaa),
                })
                .unwrap(),
            )
            .await
            .unwrap();
        // resync flag is true after construction

        fx.scanner.tick().await.unwrap();

        assert_eq!(*fx.analyzer.seen.lock().await, vec![200]);
        assert_eq!(stored_tip(&fx.store).await.unwrap().height, 200);
    }
}
