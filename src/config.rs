//! Configuration management for the transaction manager
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::finality::{recommended_finality_depth, recommended_history_depth};

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub txm: TxmConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chain: ChainConfig,
    pub keys: KeysConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxmConfig {
    pub chain_id: u64,
    #[serde(default)]
    pub eip1559: bool,
    /// Zero picks the chain's recommended depth
    #[serde(default)]
    pub finality_depth: u64,
    #[serde(default)]
    pub history_depth: u64,
    #[serde(default = "default_batch_size")]
    pub rpc_batch_size: usize,
    /// Zero means unlimited
    #[serde(default)]
    pub max_in_flight: u32,
    /// Zero means unlimited
    #[serde(default)]
    pub max_queued: u32,
    #[serde(default = "default_true")]
    pub auto_sync_nonce: bool,
    #[serde(default = "default_head_poll_interval_ms")]
    pub head_poll_interval_ms: u64,
    pub fee: FeeConfig,
    #[serde(default)]
    pub broadcaster: BroadcasterConfig,
    #[serde(default)]
    pub confirmer: ConfirmerConfig,
    #[serde(default)]
    pub resender: ResenderConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeeEstimatorMode {
    /// Always start from `price_default_wei`
    #[default]
    Fixed,
    /// Start from the node's `eth_gasPrice`, clamped to min/max
    Suggested,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    #[serde(default)]
    pub mode: FeeEstimatorMode,
    pub price_default_wei: u64,
    #[serde(default)]
    pub price_min_wei: u64,
    pub price_max_wei: u64,
    #[serde(default)]
    pub tip_cap_default_wei: u64,
    #[serde(default)]
    pub tip_cap_min_wei: u64,
    #[serde(default = "default_bump_percent")]
    pub bump_percent: u64,
    #[serde(default)]
    pub bump_min_wei: u64,
    /// Heads an attempt may sit unmined before it is bumped; zero disables bumping
    #[serde(default = "default_bump_threshold")]
    pub bump_threshold: u64,
    /// Only this many lowest-nonce unconfirmed txs are bumped; zero means all
    #[serde(default)]
    pub bump_tx_depth: u32,
    #[serde(default = "default_limit_multiplier")]
    pub limit_multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcasterConfig {
    #[serde(default = "default_fallback_poll_interval_ms")]
    pub fallback_poll_interval_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_transmit_check_timeout_ms")]
    pub transmit_check_timeout_ms: u64,
    /// Simulate every tx with `eth_call` before sending
    #[serde(default)]
    pub simulate_before_send: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmerConfig {
    #[serde(default = "default_process_head_timeout_ms")]
    pub process_head_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResenderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_resender_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_resend_after_secs")]
    pub resend_after_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_reaper_threshold_secs")]
    pub threshold_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub rpc_urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeysConfig {
    /// Env var holding comma separated hex private keys
    #[serde(default = "default_private_keys_env")]
    pub private_keys_env: String,
    /// Keys that are loaded but must not send
    #[serde(default)]
    pub disabled_addresses: Vec<Address>,
}

fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    100
}
fn default_head_poll_interval_ms() -> u64 {
    2_000
}
fn default_bump_percent() -> u64 {
    20
}
fn default_bump_threshold() -> u64 {
    3
}
fn default_limit_multiplier() -> f64 {
    1.0
}
fn default_fallback_poll_interval_ms() -> u64 {
    5_000
}
fn default_send_timeout_ms() -> u64 {
    30_000
}
fn default_transmit_check_timeout_ms() -> u64 {
    2_000
}
fn default_process_head_timeout_ms() -> u64 {
    10_000
}
fn default_resender_interval_secs() -> u64 {
    60
}
fn default_resend_after_secs() -> u64 {
    300
}
fn default_reaper_interval_secs() -> u64 {
    3_600
}
fn default_reaper_threshold_secs() -> u64 {
    7 * 24 * 3_600
}
fn default_max_connections() -> u32 {
    10
}
fn default_min_connections() -> u32 {
    1
}
fn default_private_keys_env() -> String {
    "TXM_PRIVATE_KEYS".to_string()
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            fallback_poll_interval_ms: default_fallback_poll_interval_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            transmit_check_timeout_ms: default_transmit_check_timeout_ms(),
            simulate_before_send: false,
        }
    }
}

impl Default for ConfirmerConfig {
    fn default() -> Self {
        Self {
            process_head_timeout_ms: default_process_head_timeout_ms(),
        }
    }
}

impl Default for ResenderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_resender_interval_secs(),
            resend_after_secs: default_resend_after_secs(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_reaper_interval_secs(),
            threshold_secs: default_reaper_threshold_secs(),
        }
    }
}

impl TxmConfig {
    pub fn effective_finality_depth(&self) -> u64 {
        if self.finality_depth == 0 {
            recommended_finality_depth(self.chain_id)
        } else {
            self.finality_depth
        }
    }

    pub fn effective_history_depth(&self) -> u64 {
        if self.history_depth == 0 {
            recommended_history_depth(self.chain_id)
        } else {
            self.history_depth
        }
    }

    pub fn head_poll_interval(&self) -> Duration {
        Duration::from_millis(self.head_poll_interval_ms)
    }
}

impl BroadcasterConfig {
    pub fn fallback_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_poll_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn transmit_check_timeout(&self) -> Duration {
        Duration::from_millis(self.transmit_check_timeout_ms)
    }
}

impl Settings {
    /// Load settings from the file named by `TXM_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("TXM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.txm.chain_id == 0 {
            anyhow::bail!("txm.chain_id must be set");
        }
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured (chain.rpc_urls)", self.chain.name);
        }
        if self.database.backend == StoreBackend::Postgres && self.database.url.is_empty() {
            anyhow::bail!("database.url is required for the postgres backend");
        }
        self.txm.fee.validate()
    }
}

impl FeeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.price_min_wei > self.price_max_wei {
            anyhow::bail!(
                "txm.fee.price_min_wei ({}) exceeds txm.fee.price_max_wei ({})",
                self.price_min_wei,
                self.price_max_wei
            );
        }
        if self.price_default_wei < self.price_min_wei || self.price_default_wei > self.price_max_wei {
            anyhow::bail!(
                "txm.fee.price_default_wei ({}) must be within [price_min_wei, price_max_wei]",
                self.price_default_wei
            );
        }
        if self.limit_multiplier <= 0.0 {
            anyhow::bail!("txm.fee.limit_multiplier must be greater than zero");
        }
        if self.bump_percent == 0 && self.bump_min_wei == 0 {
            anyhow::bail!(
                "Fee bump would never increase the fee: set txm.fee.bump_percent or txm.fee.bump_min_wei above zero"
            );
        }
        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[txm]
chain_id = 43114
eip1559 = true
max_in_flight = 16

[txm.fee]
price_default_wei = 25000000000
price_max_wei = 500000000000
tip_cap_default_wei = 1000000000
bump_min_wei = 5000000000

[database]
backend = "memory"

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[chain]
name = "avalanche"
rpc_urls = ["${TXM_TEST_RPC_URL}"]

[keys]
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TXM_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TXM_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file_applies_defaults() {
        env::set_var("TXM_TEST_RPC_URL", "http://localhost:8545");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.chain.rpc_urls, vec!["http://localhost:8545".to_string()]);
        assert_eq!(settings.txm.fee.bump_percent, 20);
        assert_eq!(settings.txm.fee.bump_threshold, 3);
        assert_eq!(settings.txm.broadcaster.transmit_check_timeout_ms, 2_000);
        assert_eq!(settings.txm.effective_finality_depth(), 1);
        assert_eq!(settings.keys.private_keys_env, "TXM_PRIVATE_KEYS");
        assert_eq!(settings.database.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_zero_bump_is_rejected_with_knob_name() {
        let fee = FeeConfig {
            mode: FeeEstimatorMode::Fixed,
            price_default_wei: 10,
            price_min_wei: 1,
            price_max_wei: 100,
            tip_cap_default_wei: 1,
            tip_cap_min_wei: 1,
            bump_percent: 0,
            bump_min_wei: 0,
            bump_threshold: 3,
            bump_tx_depth: 0,
            limit_multiplier: 1.0,
        };
        let err = fee.validate().unwrap_err().to_string();
        assert!(err.contains("txm.fee.bump_percent"));
    }
}
