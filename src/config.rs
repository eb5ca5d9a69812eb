//! Configuration management for the bridge engine
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub engine: EngineConfig,
    pub database: DatabaseConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Scanner tick interval in seconds
    #[serde(default = "defaults::scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Confirmation/broadcast coordinator tick interval in seconds
    #[serde(default = "defaults::coordinator_interval_secs")]
    pub coordinator_interval_secs: u64,
    /// Bounded wait for the startup barrier before the first tick
    #[serde(default = "defaults::startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// Consecutive callback errors before an entry is abandoned
    #[serde(default = "defaults::max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// Replacement broadcasts allowed before an action is abandoned
    #[serde(default = "defaults::resend_limit")]
    pub resend_limit: u32,
    /// Home-chain blocks between direct multi-sig completion probes
    #[serde(default = "defaults::contract_check_blocks")]
    pub contract_check_blocks: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "defaults::max_connections")]
    pub max_connections: u32,
    #[serde(default = "defaults::min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    /// Primary RPC endpoint pool
    pub rpc_urls: Vec<String>,
    /// Standby pool used when `use_standby` is flipped
    #[serde(default)]
    pub standby_rpc_urls: Vec<String>,
    /// Privately-authenticated endpoint of last resort
    pub emergency_rpc_url: Option<String>,
    #[serde(default)]
    pub use_standby: bool,
    /// Multi-sig escrow contract address on this chain
    pub multisig_address: String,
    pub deposit_confirmations: u64,
    pub withdraw_confirmations: u64,
    /// Seconds each director rank waits before taking over a broadcast
    #[serde(default = "defaults::rank_window_secs")]
    pub rank_window_secs: u64,
    /// Failures on an endpoint before it is considered down
    #[serde(default = "defaults::endpoint_failure_threshold")]
    pub endpoint_failure_threshold: u32,
    /// Seconds to stay on the emergency endpoint before retrying the pool
    #[serde(default = "defaults::emergency_cooldown_secs")]
    pub emergency_cooldown_secs: u64,
    /// Per-call RPC timeout in seconds
    #[serde(default = "defaults::rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    pub enabled: bool,
}

impl ChainConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn rank_window(&self) -> Duration {
        Duration::from_secs(self.rank_window_secs)
    }
}

mod defaults {
    pub fn scan_interval_secs() -> u64 {
        5
    }
    pub fn coordinator_interval_secs() -> u64 {
        10
    }
    pub fn startup_timeout_secs() -> u64 {
        30
    }
    pub fn max_consecutive_errors() -> u32 {
        5
    }
    pub fn resend_limit() -> u32 {
        3
    }
    pub fn contract_check_blocks() -> u64 {
        20
    }
    pub fn max_connections() -> u32 {
        10
    }
    pub fn min_connections() -> u32 {
        1
    }
    pub fn rank_window_secs() -> u64 {
        300
    }
    pub fn endpoint_failure_threshold() -> u32 {
        3
    }
    pub fn emergency_cooldown_secs() -> u64 {
        600
    }
    pub fn rpc_timeout_secs() -> u64 {
        10
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("HETERO_RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if !chain.enabled {
                continue;
            }
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if chain.use_standby && chain.standby_rpc_urls.is_empty() {
                anyhow::bail!("Chain {} selects the standby pool but it is empty", name);
            }
            if chain.multisig_address.is_empty() {
                anyhow::bail!("Chain {} has no multi-sig address configured", name);
            }
            if chain.withdraw_confirmations < chain.deposit_confirmations {
                anyhow::bail!(
                    "Chain {}: withdraw confirmations must be at least deposit confirmations",
                    name
                );
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
