//! Heterogeneous-chain confirmation and broadcast-coordination engine
//!
//! This crate is the node-side bridge between a home chain and external
//! account-model chains: it scans external blocks for multi-sig escrow
//! deposits, drives an unconfirmed-transaction state machine to relay them to
//! the home chain, and coordinates a quorum of bank-director nodes so that
//! exactly one of them broadcasts each outbound withdrawal, administrator
//! change or contract upgrade, tracking those transactions to confirmation
//! through forks, drops, stuck gas and RPC outages.
//!
//! The host node supplies the per-chain wire clients, key management, block
//! analyzers and home-chain callbacks as capabilities; one [`engine::ChainEngine`]
//! instance is built per external chain and owns all of that chain's state.

pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod home;
pub mod metrics;
pub mod store;

pub use config::Settings;
pub use engine::{startup_barrier, ChainCollaborators, ChainEngine};
pub use error::{EngineError, EngineResult};

/// Initialize tracing with an environment-driven filter
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hetero_relayer=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}
