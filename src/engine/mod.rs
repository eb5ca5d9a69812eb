//! Per-chain engine assembly
//!
//! One `ChainEngine` owns all mutable state for one external chain: the
//! unconfirmed ledger, the waiting-broadcast queue and the endpoint manager.
//! Engines for different chains share nothing and run fully in parallel.
//! The three periodic tasks await a one-shot readiness signal (with a bounded
//! timeout) before their first tick, and check a cooperative shutdown flag at
//! the top of every cycle.

pub mod broadcast;
pub mod confirm;
pub mod gas;
pub mod ledger;
pub mod scanner;

use crate::chain::endpoints::RpcClientFactory;
use crate::chain::{ChainTraits, RpcEndpointManager, TxSigner};
use crate::config::{ChainConfig, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::home::{DirectorRosterProvider, HomeChainCallback, PriceFeed};
use crate::store::PersistentStore;

use broadcast::BroadcastOrderCoordinator;
use confirm::ConfirmationCoordinator;
use gas::GasAccelerator;
use ledger::UnconfirmedTxLedger;
use scanner::{BlockAnalyzer, BlockScanner};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Collaborators the host node supplies for one external chain
pub struct ChainCollaborators {
    pub rpc_factory: Arc<dyn RpcClientFactory>,
    pub traits_: Arc<dyn ChainTraits>,
    pub analyzer: Arc<dyn BlockAnalyzer>,
    pub signer: Arc<dyn TxSigner>,
    pub home: Arc<dyn HomeChainCallback>,
    pub roster: Arc<dyn DirectorRosterProvider>,
    pub prices: Arc<dyn PriceFeed>,
    pub store: Arc<dyn PersistentStore>,
}

/// One-shot readiness barrier released by the host once wiring is complete
pub fn startup_barrier() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

async fn await_ready(mut ready: watch::Receiver<bool>, timeout: Duration) -> EngineResult<()> {
    if *ready.borrow() {
        return Ok(());
    }
    match tokio::time::timeout(timeout, async {
        while ready.changed().await.is_ok() {
            if *ready.borrow() {
                return true;
            }
        }
        false
    })
    .await
    {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(EngineError::StartupTimeout {
            secs: timeout.as_secs(),
        }),
    }
}

/// The confirmation and broadcast-coordination engine for one external chain
pub struct ChainEngine {
    chain: String,
    engine_config: EngineConfig,
    endpoints: Arc<RpcEndpointManager>,
    ledger: Arc<UnconfirmedTxLedger>,
    scanner: Arc<BlockScanner>,
    confirm: Arc<ConfirmationCoordinator>,
    broadcast: Arc<BroadcastOrderCoordinator>,
    roster: Arc<dyn DirectorRosterProvider>,
    ready: watch::Receiver<bool>,
    shutdown: Arc<RwLock<bool>>,
}

impl ChainEngine {
    pub fn new(
        engine_config: &EngineConfig,
        chain_config: &ChainConfig,
        collaborators: ChainCollaborators,
        ready: watch::Receiver<bool>,
    ) -> Self {
        let chain = chain_config.name.clone();
        let endpoints = Arc::new(RpcEndpointManager::new(
            chain_config,
            collaborators.rpc_factory.as_ref(),
        ));
        let ledger = Arc::new(UnconfirmedTxLedger::new(&chain, collaborators.store.clone()));

        let scanner = Arc::new(BlockScanner::new(
            &chain,
            collaborators.store.clone(),
            endpoints.clone(),
            ledger.clone(),
            collaborators.analyzer.clone(),
            collaborators.roster.clone(),
            chain_config.withdraw_confirmations * 2,
        ));

        let broadcast = Arc::new(BroadcastOrderCoordinator::new(
            &chain,
            collaborators.store.clone(),
            endpoints.clone(),
            collaborators.traits_.clone(),
            collaborators.signer.clone(),
            ledger.clone(),
            collaborators.home.clone(),
            collaborators.roster.clone(),
            chain_config.multisig_address.clone(),
            chain_config.rank_window(),
            engine_config.resend_limit,
            engine_config.contract_check_blocks,
        ));

        let gas = Arc::new(GasAccelerator::new(
            &chain,
            endpoints.clone(),
            collaborators.traits_.clone(),
            collaborators.signer.clone(),
            ledger.clone(),
            collaborators.prices.clone(),
            chain_config.multisig_address.clone(),
        ));

        let confirm = Arc::new(ConfirmationCoordinator::new(
            &chain,
            collaborators.store.clone(),
            endpoints.clone(),
            ledger.clone(),
            broadcast.clone(),
            gas,
            collaborators.home.clone(),
            collaborators.roster.clone(),
            chain_config.multisig_address.clone(),
            chain_config.deposit_confirmations,
            chain_config.withdraw_confirmations,
            engine_config.max_consecutive_errors,
            engine_config.resend_limit,
        ));

        Self {
            chain,
            engine_config: engine_config.clone(),
            endpoints,
            ledger,
            scanner,
            confirm,
            broadcast,
            roster: collaborators.roster,
            ready,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Entry point for the host to register outbound actions it learned about
    /// on the home chain
    pub fn broadcast_coordinator(&self) -> Arc<BroadcastOrderCoordinator> {
        self.broadcast.clone()
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Reload persisted state and spawn the periodic tasks
    pub async fn start(&self) -> EngineResult<Vec<JoinHandle<()>>> {
        self.ledger.load().await?;
        self.broadcast.load().await?;
        if let Some(rank) = self.roster.node_rank() {
            self.endpoints.select(rank);
        }

        let startup_timeout = Duration::from_secs(self.engine_config.startup_timeout_secs);
        let scan_interval = Duration::from_secs(self.engine_config.scan_interval_secs);
        let coord_interval = Duration::from_secs(self.engine_config.coordinator_interval_secs);

        let mut handles = Vec::new();

        handles.push(self.spawn_loop("scanner", scan_interval, startup_timeout, {
            let scanner = self.scanner.clone();
            move || {
                let scanner = scanner.clone();
                async move { scanner.tick().await }
            }
        }));

        handles.push(self.spawn_loop("confirm", coord_interval, startup_timeout, {
            let confirm = self.confirm.clone();
            move || {
                let confirm = confirm.clone();
                async move { confirm.tick().await }
            }
        }));

        handles.push(self.spawn_loop("broadcast", coord_interval, startup_timeout, {
            let broadcast = self.broadcast.clone();
            move || {
                let broadcast = broadcast.clone();
                async move { broadcast.tick().await }
            }
        }));

        info!("Chain {}: engine tasks started", self.chain);
        Ok(handles)
    }

    fn spawn_loop<F, Fut>(
        &self,
        task: &'static str,
        interval: Duration,
        startup_timeout: Duration,
        mut tick: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = EngineResult<()>> + Send,
    {
        let chain = self.chain.clone();
        let ready = self.ready.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            if let Err(e) = await_ready(ready, startup_timeout).await {
                error!("Chain {} {}: {}", chain, task, e);
                return;
            }
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                if *shutdown.read().await {
                    break;
                }
                // A tick never takes the task down; failures are logged and
                // the next tick retries
                if let Err(e) = tick().await {
                    if e.should_alert() {
                        error!("Chain {} {}: {}", chain, task, e);
                    } else {
                        warn!("Chain {} {}: {}", chain, task, e);
                    }
                }
            }
            info!("Chain {} {}: stopped", chain, task);
        })
    }

    /// Cooperative shutdown: tasks finish their current cycle and exit
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Chain {}: engine shutdown initiated", self.chain);
    }
}

/// Wait for every engine task to finish; call after [`ChainEngine::stop`]
pub async fn join_tasks(handles: Vec<JoinHandle<()>>) {
    futures::future::join_all(handles).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_barrier_passes_once_released() {
        let (tx, rx) = startup_barrier();
        let waiter = tokio::spawn(await_ready(rx, Duration::from_secs(5)));
        tx.send(true).unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_barrier_times_out() {
        let (_tx, rx) = startup_barrier();
        let result = await_ready(rx, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(EngineError::StartupTimeout { .. })));
    }

    #[tokio::test]
    async fn test_barrier_immediate_when_already_released() {
        let (tx, rx) = startup_barrier();
        tx.send(true).unwrap();
        await_ready(rx, Duration::from_millis(10)).await.unwrap();
    }
}
