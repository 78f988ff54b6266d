//! Configuration management for the swap coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::secret::HashFunction;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub database: Option<DatabaseConfig>,
    pub wallet: Option<WalletConfig>,
    /// Exchange rates keyed `FROM_TO`, e.g. `AVAX_ETH = 0.0135`
    #[serde(default)]
    pub rates: HashMap<String, f64>,
    pub networks: HashMap<String, NetworkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    pub instance_id: String,
    pub poll_interval_ms: u64,
    pub call_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub hash_function: HashFunction,
    pub safety_margin_secs: u64,
    pub intent_expiry_secs: u64,
    pub amount_tolerance: f64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            hash_function: HashFunction::Keccak256,
            safety_margin_secs: 1800,
            intent_expiry_secs: 24 * 60 * 60,
            amount_tolerance: 0.001,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
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
pub struct WalletConfig {
    pub private_key_env: Option<String>,
}

/// Which ledger back-end serves a network
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Evm,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub name: String,
    pub currency: String,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
    pub kind: LedgerKind,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub contract_address: String,
    pub explorer_url: Option<String>,
    pub confirmation_blocks: u64,
    pub block_time_secs: u64,
    /// Timelock horizon when this network carries the initiator's contract
    pub initiator_window_secs: u64,
    /// Timelock horizon when this network carries the participant's contract
    pub participant_window_secs: u64,
    pub min_timelock_secs: u64,
    pub max_timelock_secs: u64,
    pub max_swaps_per_window: u64,
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_gas_margin_percent")]
    pub gas_margin_percent: u64,
    #[serde(default = "default_gas_margin_step_percent")]
    pub gas_margin_step_percent: u64,
    /// Hash function the deployed contract verifies, if declared
    pub hash_function: Option<HashFunction>,
    /// Emergency-stop owner on memory ledgers
    pub owner: Option<String>,
    /// Opening balances on memory ledgers, in display units
    #[serde(default)]
    pub prefunded: HashMap<String, f64>,
    pub enabled: bool,
}

impl NetworkConfig {
    /// Worst-case delay before a broadcast is final on this network
    pub fn confirmation_delay_secs(&self) -> u64 {
        self.confirmation_blocks.saturating_mul(self.block_time_secs)
    }
}

fn default_decimals() -> u32 {
    18
}

fn default_gas_margin_percent() -> u64 {
    20
}

fn default_gas_margin_step_percent() -> u64 {
    30
}

fn default_max_retry_delay_ms() -> u64 {
    10_000
}

fn default_lease_ttl_secs() -> u64 {
    300
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("HTLC_SWAP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(input: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        let enabled = self.enabled_networks();
        if enabled.len() < 2 {
            anyhow::bail!("At least two networks must be enabled for cross-chain swaps");
        }

        if self.protocol.amount_tolerance <= 0.0 {
            anyhow::bail!("protocol.amount_tolerance must be positive");
        }

        for (name, network) in &enabled {
            if network.kind == LedgerKind::Evm {
                if network.rpc_urls.is_empty() {
                    anyhow::bail!("Network {} has no RPC URLs configured", name);
                }
                if network.contract_address.is_empty() {
                    anyhow::bail!("Network {} has no HTLC contract address", name);
                }
            }

            if network.min_timelock_secs >= network.max_timelock_secs {
                anyhow::bail!("Network {} has an empty timelock window", name);
            }

            for (label, window) in [
                ("initiator", network.initiator_window_secs),
                ("participant", network.participant_window_secs),
            ] {
                if window < network.min_timelock_secs || window > network.max_timelock_secs {
                    anyhow::bail!(
                        "Network {} {} window {}s is outside [{}, {}]",
                        name,
                        label,
                        window,
                        network.min_timelock_secs,
                        network.max_timelock_secs
                    );
                }
            }

            // Mixing hash functions across ledgers makes secrets unverifiable on one side
            if let Some(declared) = network.hash_function {
                if declared != self.protocol.hash_function {
                    anyhow::bail!(
                        "Network {} verifies {} but the protocol uses {}",
                        name,
                        declared.name(),
                        self.protocol.hash_function.name()
                    );
                }
            }

            if self.protocol.safety_margin_secs <= network.confirmation_delay_secs() {
                anyhow::bail!(
                    "Safety margin {}s does not exceed the confirmation delay of {} ({}s)",
                    self.protocol.safety_margin_secs,
                    name,
                    network.confirmation_delay_secs()
                );
            }
        }

        // Every ordered pair must leave room for T2 < T1 - margin
        for (from_name, from) in &enabled {
            for (to_name, to) in &enabled {
                if from_name == to_name {
                    continue;
                }
                if to.participant_window_secs + self.protocol.safety_margin_secs
                    >= from.initiator_window_secs
                {
                    anyhow::bail!(
                        "Swaps {} -> {} cannot satisfy the timelock ordering: participant window {}s + margin {}s >= initiator window {}s",
                        from_name,
                        to_name,
                        to.participant_window_secs,
                        self.protocol.safety_margin_secs,
                        from.initiator_window_secs
                    );
                }
            }
        }

        if self.database.is_none() {
            tracing::warn!("No database configured - intents and matches are kept in memory");
        }

        Ok(())
    }

    /// Get list of enabled networks
    pub fn enabled_networks(&self) -> Vec<(&String, &NetworkConfig)> {
        self.networks.iter().filter(|(_, n)| n.enabled).collect()
    }

    /// Get network config by key
    pub fn network(&self, name: &str) -> Option<&NetworkConfig> {
        self.networks.get(name).filter(|n| n.enabled)
    }

    /// Get network config by chain ID
    pub fn get_network_by_chain_id(&self, chain_id: u64) -> Option<&NetworkConfig> {
        self.networks.values().find(|n| n.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const SAMPLE: &str = r#"
[coordinator]
instance_id = "coordinator-1"
poll_interval_ms = 500
call_timeout_secs = 30
max_retries = 2
retry_delay_ms = 250
sweep_interval_secs = 3600
health_check_interval_secs = 30

[protocol]
hash_function = "keccak256"
safety_margin_secs = 1800
intent_expiry_secs = 86400
amount_tolerance = 0.001

[api]
host = "127.0.0.1"
port = 3001

[metrics]
enabled = false
port = 9090

[rates]
AVAX_ETH = 0.0135
ETH_AVAX = 74.07

[networks.fuji]
chain_id = 43113
name = "Avalanche Fuji Testnet"
currency = "AVAX"
kind = "memory"
confirmation_blocks = 1
block_time_secs = 2
initiator_window_secs = 10800
participant_window_secs = 3600
min_timelock_secs = 1800
max_timelock_secs = 172800
max_swaps_per_window = 10
rate_limit_window_secs = 86400
enabled = true

[networks.sepolia]
chain_id = 11155111
name = "Ethereum Sepolia Testnet"
currency = "ETH"
kind = "memory"
confirmation_blocks = 12
block_time_secs = 12
initiator_window_secs = 14400
participant_window_secs = 3600
min_timelock_secs = 1800
max_timelock_secs = 172800
max_swaps_per_window = 10
rate_limit_window_secs = 86400
enabled = true
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("HTLC_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${HTLC_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_sample_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.enabled_networks().len(), 2);
        assert_eq!(settings.network("fuji").unwrap().decimals, 18);
        assert_eq!(settings.rates.get("AVAX_ETH"), Some(&0.0135));
        assert_eq!(
            settings.get_network_by_chain_id(11155111).unwrap().currency,
            "ETH"
        );
    }

    #[test]
    fn test_rejects_mixed_hash_functions() {
        let input = SAMPLE.replace(
            "[networks.sepolia]\n",
            "[networks.sepolia]\nhash_function = \"sha256\"\n",
        );
        let err = Settings::from_toml_str(&input).unwrap_err();
        assert!(err.to_string().contains("sha256"));
    }

    #[test]
    fn test_rejects_unorderable_timelocks() {
        let input = SAMPLE.replace("initiator_window_secs = 10800", "initiator_window_secs = 4000");
        assert!(Settings::from_toml_str(&input).is_err());
    }

    #[test]
    fn test_rejects_margin_below_confirmation_delay() {
        let input = SAMPLE.replace("safety_margin_secs = 1800", "safety_margin_secs = 100");
        assert!(Settings::from_toml_str(&input).is_err());
    }
}
