//! RPC endpoint selection and failover
//!
//! Each director node maps its rank onto the endpoint pool so neighbors spread
//! across providers. Failures accumulate per endpoint; when both the current
//! endpoint and its computed replacement are over the threshold, the manager
//! falls back to a privately-authenticated emergency endpoint for a cooldown
//! window, then resumes pool selection with counters reset.

use crate::chain::rpc::{ChainRpcClient, RpcError, RpcErrorKind};
use crate::config::ChainConfig;

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Builds concrete RPC clients for endpoint URLs (consumed capability)
pub trait RpcClientFactory: Send + Sync {
    fn connect(&self, url: &str, timeout: Duration) -> Arc<dyn ChainRpcClient>;
}

struct Endpoint {
    url: String,
    client: Arc<dyn ChainRpcClient>,
}

/// Per-chain endpoint manager
pub struct RpcEndpointManager {
    chain: String,
    pool: Vec<Endpoint>,
    emergency: Option<Endpoint>,
    active: AtomicUsize,
    /// Consecutive failures per pool index
    failures: DashMap<usize, u32>,
    /// Accumulated rate-limit hits per pool index
    rate_limits: DashMap<usize, u32>,
    emergency_until: RwLock<Option<Instant>>,
    failure_threshold: u32,
    emergency_cooldown: Duration,
}

impl RpcEndpointManager {
    pub fn new(config: &ChainConfig, factory: &dyn RpcClientFactory) -> Self {
        let urls = if config.use_standby {
            &config.standby_rpc_urls
        } else {
            &config.rpc_urls
        };

        let pool = urls
            .iter()
            .map(|url| Endpoint {
                url: url.clone(),
                client: factory.connect(url, config.rpc_timeout()),
            })
            .collect();

        let emergency = config.emergency_rpc_url.as_ref().map(|url| Endpoint {
            url: url.clone(),
            client: factory.connect(url, config.rpc_timeout()),
        });

        Self {
            chain: config.name.clone(),
            pool,
            emergency,
            active: AtomicUsize::new(0),
            failures: DashMap::new(),
            rate_limits: DashMap::new(),
            emergency_until: RwLock::new(None),
            failure_threshold: config.endpoint_failure_threshold,
            emergency_cooldown: Duration::from_secs(config.emergency_cooldown_secs),
        }
    }

    /// Deterministically map this node's director rank onto the pool so that
    /// adjacent ranks use different endpoints when the pool allows it
    pub fn select(&self, rank: u32) {
        if self.pool.is_empty() {
            return;
        }
        let idx = (rank.saturating_sub(1) as usize) % self.pool.len();
        self.active.store(idx, Ordering::SeqCst);
        info!(
            "Chain {}: rank {} selected endpoint {}",
            self.chain, rank, self.pool[idx].url
        );
    }

    /// The currently active client (emergency endpoint while its window holds)
    pub async fn active(&self) -> Arc<dyn ChainRpcClient> {
        if let Some(ep) = self.emergency_endpoint_if_engaged().await {
            return ep;
        }
        let idx = self.active.load(Ordering::SeqCst) % self.pool.len();
        self.pool[idx].client.clone()
    }

    pub fn active_url(&self) -> String {
        let idx = self.active.load(Ordering::SeqCst) % self.pool.len();
        self.pool[idx].url.clone()
    }

    async fn emergency_endpoint_if_engaged(&self) -> Option<Arc<dyn ChainRpcClient>> {
        let mut guard = self.emergency_until.write().await;
        match (*guard, &self.emergency) {
            (Some(until), Some(ep)) if Instant::now() < until => Some(ep.client.clone()),
            (Some(_), _) => {
                // Window elapsed: resume pool selection with counters reset
                *guard = None;
                self.failures.clear();
                self.rate_limits.clear();
                info!("Chain {}: emergency window over, resuming pool", self.chain);
                None
            }
            (None, _) => None,
        }
    }

    /// Record a successful call on the active endpoint
    pub fn report_success(&self) {
        let idx = self.active.load(Ordering::SeqCst) % self.pool.len();
        self.failures.remove(&idx);
    }

    /// Record a failed call, switching endpoints according to the error kind
    pub async fn report_failure(&self, error: &RpcError) {
        let current = self.active.load(Ordering::SeqCst) % self.pool.len();

        match error.kind {
            // Connection-level errors fail over immediately
            RpcErrorKind::Connection => {
                self.advance(current);
            }
            // Rate limits accumulate and also fail over, without discarding
            // the endpoint permanently
            RpcErrorKind::RateLimited => {
                *self.rate_limits.entry(current).or_insert(0) += 1;
                self.advance(current);
            }
            RpcErrorKind::Timeout | RpcErrorKind::Rpc => {
                let count = {
                    let mut entry = self.failures.entry(current).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if count < self.failure_threshold {
                    return;
                }

                let replacement = (current + 1) % self.pool.len();
                let replacement_count =
                    self.rate_limits.get(&replacement).map(|c| *c).unwrap_or(0).max(
                        self.failures.get(&replacement).map(|c| *c).unwrap_or(0),
                    );

                if replacement_count >= self.failure_threshold {
                    self.engage_emergency().await;
                } else {
                    self.advance(current);
                }
            }
        }

        crate::metrics::record_endpoint_failover(&self.chain);
    }

    /// Run one RPC call on the active endpoint with bounded immediate
    /// retries, reporting the outcome for failover accounting
    pub async fn execute<T, F, Fut>(&self, chain: &str, mut op: F) -> crate::error::EngineResult<T>
    where
        F: FnMut(Arc<dyn ChainRpcClient>) -> Fut,
        Fut: std::future::Future<Output = crate::chain::rpc::RpcResult<T>>,
    {
        let client = self.active().await;
        match crate::chain::rpc::with_retries(|| op(client.clone())).await {
            Ok(value) => {
                self.report_success();
                Ok(value)
            }
            Err(e) => {
                self.report_failure(&e).await;
                Err(crate::error::EngineError::Rpc {
                    chain: chain.to_string(),
                    source: e,
                })
            }
        }
    }

    fn advance(&self, from: usize) {
        if self.pool.len() < 2 {
            return;
        }
        let next = (from + 1) % self.pool.len();
        self.active.store(next, Ordering::SeqCst);
        warn!(
            "Chain {}: endpoint failover {} -> {}",
            self.chain, self.pool[from].url, self.pool[next].url
        );
    }

    async fn engage_emergency(&self) {
        if self.emergency.is_none() {
            // No emergency endpoint configured; keep rotating the pool
            self.advance(self.active.load(Ordering::SeqCst) % self.pool.len());
            return;
        }
        let mut guard = self.emergency_until.write().await;
        if guard.is_none() {
            *guard = Some(Instant::now() + self.emergency_cooldown);
            warn!(
                "Chain {}: pool exhausted, switching to emergency endpoint for {:?}",
                self.chain, self.emergency_cooldown
            );
        }
    }
}
